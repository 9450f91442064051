use sea_orm_migration::prelude::*;

#[derive(DeriveIden)]
enum StoredFile {
    Table,
    Id,
    Kind,
    OriginalName,
    MimeType,
    SizeBytes,
    Data,
    CreatedAt,
}

#[derive(DeriveIden)]
enum Bill {
    Table,
    Id,
    OrderId,
    FileRef,
    CreatedAt,
}

#[derive(DeriveIden)]
enum Orders {
    Table,
    Id,
}

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(StoredFile::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(StoredFile::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(StoredFile::Kind).string_len(32).not_null())
                    .col(
                        ColumnDef::new(StoredFile::OriginalName)
                            .string_len(256)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(StoredFile::MimeType)
                            .string_len(128)
                            .not_null(),
                    )
                    .col(ColumnDef::new(StoredFile::SizeBytes).big_integer().not_null())
                    .col(ColumnDef::new(StoredFile::Data).binary().not_null())
                    .col(
                        ColumnDef::new(StoredFile::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Bill::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Bill::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(Bill::OrderId).uuid().not_null())
                    .col(ColumnDef::new(Bill::FileRef).string_len(512).not_null())
                    .col(
                        ColumnDef::new(Bill::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_bill_order")
                            .from(Bill::Table, Bill::OrderId)
                            .to(Orders::Table, Orders::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_bill_order")
                    .table(Bill::Table)
                    .col(Bill::OrderId)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Bill::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(StoredFile::Table).to_owned())
            .await
    }
}
