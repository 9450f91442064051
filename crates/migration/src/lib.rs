pub use sea_orm_migration::prelude::*;

mod m20251201_000001_customers;
mod m20251201_000002_orders;
mod m20251201_000003_files_and_bills;

pub struct Migrator;
#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20251201_000001_customers::Migration),
            Box::new(m20251201_000002_orders::Migration),
            Box::new(m20251201_000003_files_and_bills::Migration),
        ]
    }
}
