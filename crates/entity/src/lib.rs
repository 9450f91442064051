//! SeaORM entities for customers, orders and their production records.

pub mod bill;
pub mod customer;
pub mod order;
pub mod stage_record;
pub mod stored_file;
