//! Order service: creation, stage transitions, photo attachment, bills.
//!
//! Every progress write (advance, complete current stage) updates the order
//! row and its stage records in one transaction. The order row is updated
//! with a compare-and-swap on `version`, so a writer that loaded a stale
//! order loses with `CONFLICT` and nothing is written.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use entity::{bill, customer, order, stage_record};
use platform_api::{ApiError, ApiResult};
use sea_orm::prelude::DateTimeWithTimeZone;
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ActiveValue::Set, ColumnTrait, ConnectionTrait, DatabaseConnection,
    EntityTrait, QueryFilter, QueryOrder, TransactionTrait,
};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::auth::Session;
use crate::progress::{derive_stage_status, progress_percent, should_show_photo};
use crate::stages::{parse_stage, stage_numbers, FIRST_STAGE, STAGE_COUNT};

const MAX_REFERENCE_LEN: usize = 512;

#[derive(Clone, Copy, Debug, Default)]
pub struct TrackerSettings {
    /// Let admins move an order back to an earlier stage.
    pub allow_stage_regression: bool,
}

#[derive(Clone, Debug)]
pub struct OrderWithStages {
    pub order: order::Model,
    /// Sorted by stage number.
    pub stages: Vec<stage_record::Model>,
}

impl OrderWithStages {
    pub fn progress_percent(&self) -> i32 {
        progress_percent(self.order.current_stage)
    }

    pub fn stage(&self, number: i16) -> Option<&stage_record::Model> {
        self.stages.iter().find(|record| record.stage_number == number)
    }

    /// Photo reference as the given session may see it. Admins always get
    /// the stored reference; customers only inside the visibility window.
    pub fn visible_photo(&self, record: &stage_record::Model, session: &Session) -> Option<String> {
        let photo = record.photo_ref.clone()?;
        if session.is_admin()
            || should_show_photo(record.stage_number, self.order.current_stage, &self.stages)
        {
            Some(photo)
        } else {
            None
        }
    }
}

#[derive(Clone, Debug)]
pub struct NewOrder {
    pub customer_id: Uuid,
    pub product_name: String,
}

/// Partial update. `None` leaves a field alone; an empty courier string
/// clears it.
#[derive(Clone, Debug, Default)]
pub struct OrderUpdate {
    pub product_name: Option<String>,
    pub courier_id: Option<String>,
    pub courier_link: Option<String>,
    pub status: Option<order::Status>,
    pub expected_version: Option<i32>,
}

pub async fn create_order(
    db: &DatabaseConnection,
    session: &Session,
    input: NewOrder,
) -> ApiResult<OrderWithStages> {
    session.require_admin()?;
    let product_name = product_name(&input.product_name)?;
    let span = info_span!("tracker.orders.create", customer_id = %input.customer_id);
    async {
        let owner = customer::Entity::find_by_id(input.customer_id)
            .one(db)
            .await?;
        if owner.is_none() {
            return Err(ApiError::validation("unknown customer"));
        }

        let now: DateTimeWithTimeZone = Utc::now().into();
        let order_id = Uuid::new_v4();
        let txn = db.begin().await?;
        order::Entity::insert(order::ActiveModel {
            id: Set(order_id),
            customer_id: Set(input.customer_id),
            product_name: Set(product_name),
            current_stage: Set(FIRST_STAGE),
            status: Set(order::Status::Active),
            courier_id: Set(None),
            courier_link: Set(None),
            version: Set(0),
            created_at: Set(now),
            updated_at: Set(now),
        })
        .exec_without_returning(&txn)
        .await?;
        let records = stage_numbers().map(|number| {
            new_stage_record(order_id, number, derive_stage_status(number, FIRST_STAGE), now)
        });
        stage_record::Entity::insert_many(records)
            .exec_without_returning(&txn)
            .await?;
        txn.commit().await?;
        info!(order_id = %order_id, "order created");
        load_order_with_stages(db, order_id).await
    }
    .instrument(span)
    .await
}

/// Loads an order for the session, repairing missing stage records first.
/// Another customer's order reads as not found.
pub async fn get_order(
    db: &DatabaseConnection,
    session: &Session,
    id: Uuid,
) -> ApiResult<OrderWithStages> {
    let order = find_order(db, id).await?;
    if !session.can_view(order.customer_id) {
        return Err(ApiError::not_found("order"));
    }
    backfill_stage_records(db, order.id).await?;
    let stages = load_stage_records(db, order.id).await?;
    Ok(OrderWithStages { order, stages })
}

/// Newest first. Non-admin sessions only ever see their own orders,
/// whatever `customer_id` asks for.
pub async fn list_orders(
    db: &DatabaseConnection,
    session: &Session,
    customer_id: Option<Uuid>,
) -> ApiResult<Vec<OrderWithStages>> {
    let scope = if session.is_admin() {
        customer_id
    } else {
        Some(session.customer_id)
    };
    let mut query = order::Entity::find();
    if let Some(customer_id) = scope {
        query = query.filter(order::Column::CustomerId.eq(customer_id));
    }
    let orders = query
        .order_by_desc(order::Column::CreatedAt)
        .order_by_desc(order::Column::Id)
        .all(db)
        .await?;
    if orders.is_empty() {
        return Ok(Vec::new());
    }

    let ids: Vec<Uuid> = orders.iter().map(|o| o.id).collect();
    let mut by_order: HashMap<Uuid, Vec<stage_record::Model>> = HashMap::new();
    for record in stage_record::Entity::find()
        .filter(stage_record::Column::OrderId.is_in(ids))
        .order_by_asc(stage_record::Column::StageNumber)
        .all(db)
        .await?
    {
        by_order.entry(record.order_id).or_default().push(record);
    }
    Ok(orders
        .into_iter()
        .map(|order| {
            let stages = by_order.remove(&order.id).unwrap_or_default();
            OrderWithStages { order, stages }
        })
        .collect())
}

/// Moves the order to `new_stage` and re-derives every stage record's
/// status from it. When `expected_version` is given it must match the
/// stored version.
pub async fn advance_order(
    db: &DatabaseConnection,
    session: &Session,
    settings: &TrackerSettings,
    id: Uuid,
    new_stage: i32,
    expected_version: Option<i32>,
) -> ApiResult<OrderWithStages> {
    session.require_admin()?;
    let new_stage = parse_stage(new_stage)?;
    let span = info_span!("tracker.orders.advance", order_id = %id, stage = new_stage);
    async {
        let txn = db.begin().await?;
        let existing = find_order(&txn, id).await?;
        check_version(&existing, expected_version)?;
        if new_stage < existing.current_stage && !settings.allow_stage_regression {
            return Err(ApiError::validation(format!(
                "order is at stage {} and cannot move back to stage {}",
                existing.current_stage, new_stage
            )));
        }
        // The target stage goes back to in progress, so a completed order
        // is active again even when it stays on the final stage.
        let status = match existing.status {
            order::Status::Completed => order::Status::Active,
            other => other,
        };

        let now: DateTimeWithTimeZone = Utc::now().into();
        backfill_stage_records(&txn, id).await?;
        swap_order_progress(&txn, &existing, new_stage, status, now).await?;
        rederive_stage_statuses(&txn, id, new_stage, now).await?;
        txn.commit().await?;

        info!(from = existing.current_stage, to = new_stage, "order stage changed");
        load_order_with_stages(db, id).await
    }
    .instrument(span)
    .await
}

/// Marks the current stage's record completed without moving the order.
/// On the final stage the order itself becomes completed.
pub async fn complete_current_stage(
    db: &DatabaseConnection,
    session: &Session,
    id: Uuid,
    expected_version: Option<i32>,
) -> ApiResult<OrderWithStages> {
    session.require_admin()?;
    let span = info_span!("tracker.orders.complete_stage", order_id = %id);
    async {
        let txn = db.begin().await?;
        let existing = find_order(&txn, id).await?;
        check_version(&existing, expected_version)?;
        let current = existing.current_stage;
        let status = if current >= STAGE_COUNT {
            order::Status::Completed
        } else {
            existing.status
        };

        let now: DateTimeWithTimeZone = Utc::now().into();
        backfill_stage_records(&txn, id).await?;
        swap_order_progress(&txn, &existing, current, status, now).await?;
        stage_record::Entity::update_many()
            .col_expr(
                stage_record::Column::Status,
                Expr::value(stage_record::Status::Completed),
            )
            .col_expr(stage_record::Column::UpdatedAt, Expr::value(now))
            .filter(stage_record::Column::OrderId.eq(id))
            .filter(stage_record::Column::StageNumber.eq(current))
            .exec(&txn)
            .await?;
        txn.commit().await?;

        info!(stage = current, "current stage completed");
        load_order_with_stages(db, id).await
    }
    .instrument(span)
    .await
}

/// Records a photo reference on one stage. Never touches statuses or the
/// order's current stage.
pub async fn attach_stage_photo(
    db: &DatabaseConnection,
    session: &Session,
    order_id: Uuid,
    stage: i32,
    reference: &str,
) -> ApiResult<OrderWithStages> {
    session.require_admin()?;
    let stage = parse_stage(stage)?;
    let reference = file_reference(reference)?;
    let span = info_span!("tracker.orders.attach_photo", order_id = %order_id, stage);
    async {
        find_order(db, order_id).await?;
        backfill_stage_records(db, order_id).await?;
        let updated = stage_record::Entity::update_many()
            .col_expr(stage_record::Column::PhotoRef, Expr::value(reference))
            .col_expr(
                stage_record::Column::UpdatedAt,
                Expr::value(DateTimeWithTimeZone::from(Utc::now())),
            )
            .filter(stage_record::Column::OrderId.eq(order_id))
            .filter(stage_record::Column::StageNumber.eq(stage))
            .exec(db)
            .await?;
        if updated.rows_affected == 0 {
            return Err(ApiError::not_found("stage record"));
        }
        load_order_with_stages(db, order_id).await
    }
    .instrument(span)
    .await
}

/// Applies a partial update through the same version compare-and-swap as
/// stage changes, so every committed write gets its own version.
pub async fn update_order(
    db: &DatabaseConnection,
    session: &Session,
    id: Uuid,
    update: OrderUpdate,
) -> ApiResult<OrderWithStages> {
    session.require_admin()?;
    let existing = find_order(db, id).await?;
    check_version(&existing, update.expected_version)?;

    let mut query = order::Entity::update_many()
        .col_expr(order::Column::Version, Expr::value(existing.version + 1))
        .col_expr(
            order::Column::UpdatedAt,
            Expr::value(DateTimeWithTimeZone::from(Utc::now())),
        )
        .filter(order::Column::Id.eq(id))
        .filter(order::Column::Version.eq(existing.version));
    if let Some(name) = update.product_name.as_deref() {
        query = query.col_expr(order::Column::ProductName, Expr::value(product_name(name)?));
    }
    if let Some(courier_id) = update.courier_id.as_deref() {
        query = query.col_expr(order::Column::CourierId, Expr::value(optional_text(courier_id)));
    }
    if let Some(courier_link) = update.courier_link.as_deref() {
        query = query.col_expr(
            order::Column::CourierLink,
            Expr::value(optional_text(courier_link)),
        );
    }
    if let Some(status) = update.status {
        query = query.col_expr(order::Column::Status, Expr::value(status));
    }

    let result = query.exec(db).await?;
    if result.rows_affected == 0 {
        warn!(order_id = %id, version = existing.version, "lost order version race");
        return Err(version_conflict());
    }
    info!(order_id = %id, version = existing.version + 1, "order updated");
    load_order_with_stages(db, id).await
}

pub async fn add_bill(
    db: &DatabaseConnection,
    session: &Session,
    order_id: Uuid,
    reference: &str,
) -> ApiResult<bill::Model> {
    session.require_admin()?;
    let reference = file_reference(reference)?;
    find_order(db, order_id).await?;
    let id = Uuid::new_v4();
    bill::Entity::insert(bill::ActiveModel {
        id: Set(id),
        order_id: Set(order_id),
        file_ref: Set(reference),
        created_at: Set(Utc::now().into()),
    })
    .exec_without_returning(db)
    .await?;
    info!(order_id = %order_id, bill_id = %id, "bill added");
    bill::Entity::find_by_id(id)
        .one(db)
        .await?
        .ok_or_else(|| ApiError::internal(anyhow::anyhow!("inserted bill {} missing", id)))
}

pub async fn list_bills(
    db: &DatabaseConnection,
    session: &Session,
    order_id: Uuid,
) -> ApiResult<Vec<bill::Model>> {
    let order = find_order(db, order_id).await?;
    if !session.can_view(order.customer_id) {
        return Err(ApiError::not_found("order"));
    }
    let bills = bill::Entity::find()
        .filter(bill::Column::OrderId.eq(order_id))
        .order_by_desc(bill::Column::CreatedAt)
        .all(db)
        .await?;
    Ok(bills)
}

/// Inserts a pending record for every catalog stage the order lacks.
/// Safe to run concurrently: the (order, stage) unique index turns a lost
/// race into a no-op. Returns how many records were created.
pub async fn backfill_stage_records<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
) -> ApiResult<usize> {
    let present: HashSet<i16> = stage_record::Entity::find()
        .filter(stage_record::Column::OrderId.eq(order_id))
        .all(conn)
        .await?
        .into_iter()
        .map(|record| record.stage_number)
        .collect();
    let now: DateTimeWithTimeZone = Utc::now().into();
    let missing: Vec<_> = stage_numbers()
        .filter(|number| !present.contains(number))
        .map(|number| new_stage_record(order_id, number, stage_record::Status::Pending, now))
        .collect();
    if missing.is_empty() {
        return Ok(0);
    }

    let count = missing.len();
    stage_record::Entity::insert_many(missing)
        .on_conflict(
            OnConflict::columns([
                stage_record::Column::OrderId,
                stage_record::Column::StageNumber,
            ])
            .do_nothing()
            .to_owned(),
        )
        .exec_without_returning(conn)
        .await?;
    warn!(order_id = %order_id, count, "backfilled missing stage records");
    Ok(count)
}

async fn find_order<C: ConnectionTrait>(conn: &C, id: Uuid) -> ApiResult<order::Model> {
    order::Entity::find_by_id(id)
        .one(conn)
        .await?
        .ok_or_else(|| ApiError::not_found("order"))
}

async fn load_stage_records<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
) -> ApiResult<Vec<stage_record::Model>> {
    let records = stage_record::Entity::find()
        .filter(stage_record::Column::OrderId.eq(order_id))
        .order_by_asc(stage_record::Column::StageNumber)
        .all(conn)
        .await?;
    Ok(records)
}

async fn load_order_with_stages<C: ConnectionTrait>(
    conn: &C,
    id: Uuid,
) -> ApiResult<OrderWithStages> {
    let order = find_order(conn, id).await?;
    let stages = load_stage_records(conn, id).await?;
    Ok(OrderWithStages { order, stages })
}

fn check_version(order: &order::Model, expected: Option<i32>) -> ApiResult<()> {
    match expected {
        Some(version) if version != order.version => {
            warn!(order_id = %order.id, expected = version, actual = order.version, "stale order version");
            Err(version_conflict())
        }
        _ => Ok(()),
    }
}

/// Compare-and-swap on the order row: only applies when nobody bumped the
/// version since `existing` was read.
async fn swap_order_progress<C: ConnectionTrait>(
    conn: &C,
    existing: &order::Model,
    current_stage: i16,
    status: order::Status,
    now: DateTimeWithTimeZone,
) -> ApiResult<()> {
    let result = order::Entity::update_many()
        .col_expr(order::Column::CurrentStage, Expr::value(current_stage))
        .col_expr(order::Column::Status, Expr::value(status))
        .col_expr(order::Column::Version, Expr::value(existing.version + 1))
        .col_expr(order::Column::UpdatedAt, Expr::value(now))
        .filter(order::Column::Id.eq(existing.id))
        .filter(order::Column::Version.eq(existing.version))
        .exec(conn)
        .await?;
    if result.rows_affected == 0 {
        warn!(order_id = %existing.id, version = existing.version, "lost order version race");
        return Err(version_conflict());
    }
    Ok(())
}

fn version_conflict() -> ApiError {
    ApiError::conflict("order was changed by someone else, reload and retry")
}

async fn rederive_stage_statuses<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
    current_stage: i16,
    now: DateTimeWithTimeZone,
) -> ApiResult<()> {
    let groups = [
        (
            stage_record::Status::Completed,
            stage_record::Column::StageNumber.lt(current_stage),
        ),
        (
            stage_record::Status::InProgress,
            stage_record::Column::StageNumber.eq(current_stage),
        ),
        (
            stage_record::Status::Pending,
            stage_record::Column::StageNumber.gt(current_stage),
        ),
    ];
    for (status, range) in groups {
        stage_record::Entity::update_many()
            .col_expr(stage_record::Column::Status, Expr::value(status))
            .col_expr(stage_record::Column::UpdatedAt, Expr::value(now))
            .filter(stage_record::Column::OrderId.eq(order_id))
            .filter(range)
            .filter(stage_record::Column::Status.ne(status))
            .exec(conn)
            .await?;
    }
    Ok(())
}

fn new_stage_record(
    order_id: Uuid,
    stage_number: i16,
    status: stage_record::Status,
    now: DateTimeWithTimeZone,
) -> stage_record::ActiveModel {
    stage_record::ActiveModel {
        id: Set(Uuid::new_v4()),
        order_id: Set(order_id),
        stage_number: Set(stage_number),
        status: Set(status),
        photo_ref: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
    }
}

fn product_name(value: &str) -> ApiResult<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ApiError::validation("product name is required"));
    }
    if trimmed.chars().count() > 256 {
        return Err(ApiError::validation("product name is too long"));
    }
    Ok(trimmed.to_string())
}

fn file_reference(value: &str) -> ApiResult<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ApiError::validation("file reference is required"));
    }
    if trimmed.len() > MAX_REFERENCE_LEN {
        return Err(ApiError::validation("file reference is too long"));
    }
    Ok(trimmed.to_string())
}

fn optional_text(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Role;

    fn order_at(current_stage: i16, statuses: &[stage_record::Status]) -> OrderWithStages {
        let now: DateTimeWithTimeZone = Utc::now().into();
        let order_id = Uuid::new_v4();
        let stages = statuses
            .iter()
            .enumerate()
            .map(|(i, status)| stage_record::Model {
                id: Uuid::new_v4(),
                order_id,
                stage_number: i as i16 + 1,
                status: *status,
                photo_ref: Some(format!("/files/photo-{}", i + 1)),
                created_at: now,
                updated_at: now,
            })
            .collect();
        OrderWithStages {
            order: order::Model {
                id: order_id,
                customer_id: Uuid::new_v4(),
                product_name: "Ring".into(),
                current_stage,
                status: order::Status::Active,
                courier_id: None,
                courier_link: None,
                version: 0,
                created_at: now,
                updated_at: now,
            },
            stages,
        }
    }

    #[test]
    fn customers_only_get_photos_inside_the_window() {
        use stage_record::Status::*;
        let view = order_at(3, &[Completed, Completed, InProgress, Pending, Pending]);
        let customer = Session::new(view.order.customer_id, Role::User);
        let visible: Vec<bool> = view
            .stages
            .iter()
            .map(|record| view.visible_photo(record, &customer).is_some())
            .collect();
        assert_eq!(visible, vec![false, true, true, true, true]);

        let admin = Session::new(Uuid::new_v4(), Role::Admin);
        assert!(view
            .stages
            .iter()
            .all(|record| view.visible_photo(record, &admin).is_some()));
    }

    #[test]
    fn stale_expected_version_is_a_conflict() {
        let view = order_at(1, &[]);
        assert!(check_version(&view.order, None).is_ok());
        assert!(check_version(&view.order, Some(0)).is_ok());
        let err = check_version(&view.order, Some(3)).unwrap_err();
        assert_eq!(err.code(), "CONFLICT");
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn progress_swap_loses_to_a_concurrent_bump() {
        use migration::{Migrator, MigratorTrait};
        use sea_orm::Database;

        let db = Database::connect("sqlite::memory:").await.unwrap();
        Migrator::up(&db, None).await.unwrap();
        let (admin, _) = crate::customers::seed_admin(&db, "Admin", "9999999999", "9999999999")
            .await
            .unwrap();
        let session = Session::from(&admin);
        let view = create_order(
            &db,
            &session,
            NewOrder {
                customer_id: admin.id,
                product_name: "Ring".into(),
            },
        )
        .await
        .unwrap();

        let stale = view.order.clone();
        order::Entity::update_many()
            .col_expr(order::Column::Version, Expr::value(stale.version + 1))
            .filter(order::Column::Id.eq(stale.id))
            .exec(&db)
            .await
            .unwrap();

        let err = swap_order_progress(&db, &stale, 3, order::Status::Active, Utc::now().into())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CONFLICT");
        let stored = find_order(&db, stale.id).await.unwrap();
        assert_eq!(stored.current_stage, 1);
        assert_eq!(stored.version, stale.version + 1);
    }

    #[test]
    fn courier_fields_clear_on_blank() {
        assert_eq!(optional_text("  "), None);
        assert_eq!(optional_text(" DTDC123 "), Some("DTDC123".into()));
        assert!(product_name("   ").is_err());
        assert!(file_reference("").is_err());
    }
}
