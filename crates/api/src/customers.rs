use chrono::Utc;
use entity::{bill, customer, order, stage_record};
use platform_api::{ApiError, ApiResult};
use sea_orm::prelude::DateTimeWithTimeZone;
use sea_orm::{
    ActiveValue::Set, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, TransactionTrait,
};
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

use crate::auth::{hash_password, verify_password, Role, Session};

#[derive(Clone, Debug)]
pub struct NewCustomer {
    pub name: String,
    pub mobile_number: String,
    pub password: String,
    pub role: Role,
}

pub async fn create_customer(
    db: &DatabaseConnection,
    session: &Session,
    input: NewCustomer,
) -> ApiResult<customer::Model> {
    session.require_admin()?;
    let span = info_span!("tracker.customers.create", role = input.role.as_str());
    insert_customer(db, input).instrument(span).await
}

pub async fn get_customer(db: &DatabaseConnection, id: Uuid) -> ApiResult<customer::Model> {
    customer::Entity::find_by_id(id)
        .one(db)
        .await?
        .ok_or_else(|| ApiError::not_found("customer"))
}

/// Newest first, optionally narrowed to one role.
pub async fn list_customers(
    db: &DatabaseConnection,
    session: &Session,
    role: Option<Role>,
) -> ApiResult<Vec<customer::Model>> {
    session.require_admin()?;
    let mut query = customer::Entity::find();
    if let Some(role) = role {
        query = query.filter(customer::Column::Role.eq(customer::Role::from(role)));
    }
    let rows = query
        .order_by_desc(customer::Column::CreatedAt)
        .order_by_asc(customer::Column::Name)
        .all(db)
        .await?;
    Ok(rows)
}

/// Removes the customer together with their orders, stage records and bills
/// in a single transaction.
pub async fn delete_customer(
    db: &DatabaseConnection,
    session: &Session,
    id: Uuid,
) -> ApiResult<bool> {
    session.require_admin()?;
    if session.customer_id == id {
        return Err(ApiError::validation("cannot delete the signed-in account"));
    }
    let span = info_span!("tracker.customers.delete", customer_id = %id);
    delete_customer_cascade(db, id).instrument(span).await
}

async fn delete_customer_cascade(db: &DatabaseConnection, id: Uuid) -> ApiResult<bool> {
    let txn = db.begin().await?;
    if customer::Entity::find_by_id(id).one(&txn).await?.is_none() {
        return Err(ApiError::not_found("customer"));
    }
    let order_ids: Vec<Uuid> = order::Entity::find()
        .select_only()
        .column(order::Column::Id)
        .filter(order::Column::CustomerId.eq(id))
        .into_tuple()
        .all(&txn)
        .await?;
    delete_order_children(&txn, &order_ids).await?;
    let orders = order::Entity::delete_many()
        .filter(order::Column::CustomerId.eq(id))
        .exec(&txn)
        .await?;
    let removed = customer::Entity::delete_by_id(id).exec(&txn).await?;
    txn.commit().await?;
    info!(orders = orders.rows_affected, "customer deleted");
    Ok(removed.rows_affected > 0)
}

async fn delete_order_children<C: ConnectionTrait>(conn: &C, order_ids: &[Uuid]) -> ApiResult<()> {
    if order_ids.is_empty() {
        return Ok(());
    }
    stage_record::Entity::delete_many()
        .filter(stage_record::Column::OrderId.is_in(order_ids.iter().copied()))
        .exec(conn)
        .await?;
    bill::Entity::delete_many()
        .filter(bill::Column::OrderId.is_in(order_ids.iter().copied()))
        .exec(conn)
        .await?;
    Ok(())
}

/// Checks a mobile number and password pair. `None` means the credentials
/// did not match; callers must not reveal which half was wrong.
pub async fn authenticate(
    db: &DatabaseConnection,
    mobile_number: &str,
    password: &str,
) -> ApiResult<Option<customer::Model>> {
    let mobile = mobile_number.trim();
    if mobile.is_empty() || password.is_empty() {
        return Ok(None);
    }
    let found = customer::Entity::find()
        .filter(customer::Column::MobileNumber.eq(mobile))
        .one(db)
        .await?;
    Ok(found.filter(|model| verify_password(password, &model.password_hash)))
}

/// Creates the admin account unless a customer with that mobile number
/// already exists. Returns the account and whether it was created.
pub async fn seed_admin(
    db: &DatabaseConnection,
    name: &str,
    mobile_number: &str,
    password: &str,
) -> ApiResult<(customer::Model, bool)> {
    let existing = customer::Entity::find()
        .filter(customer::Column::MobileNumber.eq(mobile_number.trim()))
        .one(db)
        .await?;
    if let Some(model) = existing {
        return Ok((model, false));
    }
    let created = insert_customer(
        db,
        NewCustomer {
            name: name.to_string(),
            mobile_number: mobile_number.to_string(),
            password: password.to_string(),
            role: Role::Admin,
        },
    )
    .await?;
    Ok((created, true))
}

async fn insert_customer(
    db: &DatabaseConnection,
    input: NewCustomer,
) -> ApiResult<customer::Model> {
    let name = required("name", &input.name)?;
    let mobile_number = normalize_mobile(&input.mobile_number)?;
    if input.password.is_empty() {
        return Err(ApiError::validation("password is required"));
    }
    let taken = customer::Entity::find()
        .filter(customer::Column::MobileNumber.eq(mobile_number.clone()))
        .one(db)
        .await?;
    if taken.is_some() {
        return Err(ApiError::conflict(
            "a customer with this mobile number already exists",
        ));
    }

    let now: DateTimeWithTimeZone = Utc::now().into();
    let id = Uuid::new_v4();
    let active = customer::ActiveModel {
        id: Set(id),
        name: Set(name),
        mobile_number: Set(mobile_number),
        password_hash: Set(hash_password(&input.password)?),
        role: Set(input.role.into()),
        created_at: Set(now),
        updated_at: Set(now),
    };
    customer::Entity::insert(active)
        .exec_without_returning(db)
        .await?;
    info!(customer_id = %id, "customer created");
    get_customer(db, id).await
}

fn required(field: &str, value: &str) -> ApiResult<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ApiError::validation(format!("{} is required", field)));
    }
    Ok(trimmed.to_string())
}

fn normalize_mobile(value: &str) -> ApiResult<String> {
    let trimmed = required("mobile number", value)?;
    let valid = trimmed
        .chars()
        .enumerate()
        .all(|(i, c)| c.is_ascii_digit() || (i == 0 && c == '+'));
    if !valid || trimmed.len() < 6 || trimmed.len() > 20 {
        return Err(ApiError::validation("mobile number must contain only digits"));
    }
    Ok(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mobile_numbers_are_trimmed_and_checked() {
        assert_eq!(normalize_mobile(" 9999999999 ").unwrap(), "9999999999");
        assert_eq!(normalize_mobile("+919876543210").unwrap(), "+919876543210");
        assert!(normalize_mobile("").is_err());
        assert!(normalize_mobile("98-76").is_err());
        assert!(normalize_mobile("12345").is_err());
    }

    #[test]
    fn blank_required_fields_are_rejected() {
        let err = required("name", "   ").unwrap_err();
        assert_eq!(err.to_string(), "name is required");
    }
}
