use std::sync::Arc;

use async_graphql::{
    Context, EmptySubscription, Enum, InputObject, Object, Schema, SimpleObject, ID,
};
use chrono::{DateTime, Utc};
use entity::{bill, customer, order, stage_record};
use platform_api::{gql_error, ApiError};
use sea_orm::DatabaseConnection;
use uuid::Uuid;

use crate::auth::{issue_token, AuthConfig, Role, Session, SESSION_COOKIE};
use crate::customers::{self, NewCustomer};
use crate::orders::{self, NewOrder, OrderUpdate, OrderWithStages, TrackerSettings};
use crate::stages::{self, Stage, STAGES};

pub type TrackerSchema = Schema<QueryRoot, MutationRoot, EmptySubscription>;

pub struct AppSchema(pub TrackerSchema);

pub fn build_schema(
    db: Arc<DatabaseConnection>,
    auth: Arc<AuthConfig>,
    settings: TrackerSettings,
) -> AppSchema {
    let schema = Schema::build(QueryRoot, MutationRoot, EmptySubscription)
        .data(db)
        .data(auth)
        .data(settings)
        .finish();
    AppSchema(schema)
}

pub struct QueryRoot;
pub struct MutationRoot;

#[Object]
impl QueryRoot {
    async fn tracker(&self) -> TrackerQuery {
        TrackerQuery
    }
}

#[Object]
impl MutationRoot {
    async fn tracker(&self) -> TrackerMutation {
        TrackerMutation
    }
}

#[derive(Default)]
pub struct TrackerQuery;

#[derive(Default)]
pub struct TrackerMutation;

#[Object]
impl TrackerQuery {
    async fn me(&self, ctx: &Context<'_>) -> async_graphql::Result<MePayload> {
        let session = session(ctx)?;
        let db = database(ctx)?;
        let model = customers::get_customer(db.as_ref(), session.customer_id)
            .await
            .map_err(gql_error)?;
        Ok(MePayload {
            role: CustomerRole::from(model.role),
            customer: model.into(),
        })
    }

    /// The production pipeline, in order.
    async fn stages(&self) -> Vec<StageNode> {
        STAGES.iter().map(StageNode::from).collect()
    }

    async fn customers(
        &self,
        ctx: &Context<'_>,
        role: Option<CustomerRole>,
    ) -> async_graphql::Result<Vec<CustomerNode>> {
        let session = session(ctx)?;
        let db = database(ctx)?;
        let rows = customers::list_customers(db.as_ref(), &session, role.map(Role::from))
            .await
            .map_err(gql_error)?;
        Ok(rows.into_iter().map(CustomerNode::from).collect())
    }

    async fn order(&self, ctx: &Context<'_>, id: ID) -> async_graphql::Result<OrderNode> {
        let session = session(ctx)?;
        let db = database(ctx)?;
        let view = orders::get_order(db.as_ref(), &session, parse_uuid(&id)?)
            .await
            .map_err(gql_error)?;
        Ok(OrderNode::from_view(view, &session))
    }

    /// Admins may filter by customer; customers always get their own orders.
    async fn orders(
        &self,
        ctx: &Context<'_>,
        #[graphql(name = "customerId")] customer_id: Option<ID>,
    ) -> async_graphql::Result<Vec<OrderNode>> {
        let session = session(ctx)?;
        let db = database(ctx)?;
        let customer_id = customer_id.as_ref().map(parse_uuid).transpose()?;
        let views = orders::list_orders(db.as_ref(), &session, customer_id)
            .await
            .map_err(gql_error)?;
        Ok(views
            .into_iter()
            .map(|view| OrderNode::from_view(view, &session))
            .collect())
    }

    async fn bills(
        &self,
        ctx: &Context<'_>,
        #[graphql(name = "orderId")] order_id: ID,
    ) -> async_graphql::Result<Vec<BillNode>> {
        let session = session(ctx)?;
        let db = database(ctx)?;
        let rows = orders::list_bills(db.as_ref(), &session, parse_uuid(&order_id)?)
            .await
            .map_err(gql_error)?;
        Ok(rows.into_iter().map(BillNode::from).collect())
    }
}

#[Object]
impl TrackerMutation {
    async fn login(
        &self,
        ctx: &Context<'_>,
        #[graphql(name = "mobileNumber")] mobile_number: String,
        password: String,
    ) -> async_graphql::Result<AuthPayload> {
        let db = database(ctx)?;
        let auth = auth_config(ctx)?;
        let found = customers::authenticate(db.as_ref(), &mobile_number, &password)
            .await
            .map_err(gql_error)?;
        let Some(model) = found else {
            return Ok(AuthPayload {
                ok: false,
                error: Some("Invalid credentials".into()),
                ..AuthPayload::default()
            });
        };
        let token = issue_token(model.id, model.role.into(), &auth)
            .map_err(|err| gql_error(ApiError::internal(err.into())))?;
        append_session_cookie(ctx, &token, auth.session_ttl_minutes);
        tracing::info!(customer_id = %model.id, "signed in");
        Ok(AuthPayload {
            ok: true,
            customer: Some(model.into()),
            token: Some(token),
            error: None,
        })
    }

    async fn logout(&self, ctx: &Context<'_>) -> async_graphql::Result<bool> {
        append_session_cookie(ctx, "", -1);
        Ok(true)
    }

    #[graphql(name = "createCustomer")]
    async fn create_customer(
        &self,
        ctx: &Context<'_>,
        input: NewCustomerInput,
    ) -> async_graphql::Result<CustomerNode> {
        let session = session(ctx)?;
        let db = database(ctx)?;
        let model = customers::create_customer(
            db.as_ref(),
            &session,
            NewCustomer {
                name: input.name,
                mobile_number: input.mobile_number,
                password: input.password,
                role: input.role.unwrap_or_default().into(),
            },
        )
        .await
        .map_err(gql_error)?;
        Ok(model.into())
    }

    #[graphql(name = "deleteCustomer")]
    async fn delete_customer(&self, ctx: &Context<'_>, id: ID) -> async_graphql::Result<bool> {
        let session = session(ctx)?;
        let db = database(ctx)?;
        customers::delete_customer(db.as_ref(), &session, parse_uuid(&id)?)
            .await
            .map_err(gql_error)
    }

    #[graphql(name = "createOrder")]
    async fn create_order(
        &self,
        ctx: &Context<'_>,
        input: NewOrderInput,
    ) -> async_graphql::Result<OrderNode> {
        let session = session(ctx)?;
        let db = database(ctx)?;
        let view = orders::create_order(
            db.as_ref(),
            &session,
            NewOrder {
                customer_id: parse_uuid(&input.customer_id)?,
                product_name: input.product_name,
            },
        )
        .await
        .map_err(gql_error)?;
        Ok(OrderNode::from_view(view, &session))
    }

    #[graphql(name = "updateOrder")]
    async fn update_order(
        &self,
        ctx: &Context<'_>,
        id: ID,
        input: UpdateOrderInput,
    ) -> async_graphql::Result<OrderNode> {
        let session = session(ctx)?;
        let db = database(ctx)?;
        let update = OrderUpdate {
            product_name: input.product_name,
            courier_id: input.courier_id,
            courier_link: input.courier_link,
            status: input.status.map(order::Status::from),
            expected_version: input.expected_version,
        };
        let view = orders::update_order(db.as_ref(), &session, parse_uuid(&id)?, update)
            .await
            .map_err(gql_error)?;
        Ok(OrderNode::from_view(view, &session))
    }

    #[graphql(name = "advanceOrder")]
    async fn advance_order(
        &self,
        ctx: &Context<'_>,
        id: ID,
        stage: i32,
        #[graphql(name = "expectedVersion")] expected_version: Option<i32>,
    ) -> async_graphql::Result<OrderNode> {
        let session = session(ctx)?;
        let db = database(ctx)?;
        let settings = settings(ctx);
        let view = orders::advance_order(
            db.as_ref(),
            &session,
            &settings,
            parse_uuid(&id)?,
            stage,
            expected_version,
        )
        .await
        .map_err(gql_error)?;
        Ok(OrderNode::from_view(view, &session))
    }

    #[graphql(name = "completeCurrentStage")]
    async fn complete_current_stage(
        &self,
        ctx: &Context<'_>,
        id: ID,
        #[graphql(name = "expectedVersion")] expected_version: Option<i32>,
    ) -> async_graphql::Result<OrderNode> {
        let session = session(ctx)?;
        let db = database(ctx)?;
        let view =
            orders::complete_current_stage(db.as_ref(), &session, parse_uuid(&id)?, expected_version)
                .await
                .map_err(gql_error)?;
        Ok(OrderNode::from_view(view, &session))
    }

    #[graphql(name = "attachStagePhoto")]
    async fn attach_stage_photo(
        &self,
        ctx: &Context<'_>,
        #[graphql(name = "orderId")] order_id: ID,
        stage: i32,
        reference: String,
    ) -> async_graphql::Result<OrderNode> {
        let session = session(ctx)?;
        let db = database(ctx)?;
        let view = orders::attach_stage_photo(
            db.as_ref(),
            &session,
            parse_uuid(&order_id)?,
            stage,
            &reference,
        )
        .await
        .map_err(gql_error)?;
        Ok(OrderNode::from_view(view, &session))
    }

    #[graphql(name = "addBill")]
    async fn add_bill(
        &self,
        ctx: &Context<'_>,
        #[graphql(name = "orderId")] order_id: ID,
        reference: String,
    ) -> async_graphql::Result<BillNode> {
        let session = session(ctx)?;
        let db = database(ctx)?;
        let model = orders::add_bill(db.as_ref(), &session, parse_uuid(&order_id)?, &reference)
            .await
            .map_err(gql_error)?;
        Ok(model.into())
    }
}

#[derive(Enum, Copy, Clone, Debug, Eq, PartialEq, Default)]
pub enum CustomerRole {
    #[default]
    User,
    Admin,
}

impl From<customer::Role> for CustomerRole {
    fn from(value: customer::Role) -> Self {
        match value {
            customer::Role::User => CustomerRole::User,
            customer::Role::Admin => CustomerRole::Admin,
        }
    }
}

impl From<CustomerRole> for Role {
    fn from(value: CustomerRole) -> Self {
        match value {
            CustomerRole::User => Role::User,
            CustomerRole::Admin => Role::Admin,
        }
    }
}

#[derive(Enum, Copy, Clone, Debug, Eq, PartialEq)]
pub enum OrderStatus {
    Active,
    Completed,
    Cancelled,
}

impl From<order::Status> for OrderStatus {
    fn from(value: order::Status) -> Self {
        match value {
            order::Status::Active => OrderStatus::Active,
            order::Status::Completed => OrderStatus::Completed,
            order::Status::Cancelled => OrderStatus::Cancelled,
        }
    }
}

impl From<OrderStatus> for order::Status {
    fn from(value: OrderStatus) -> Self {
        match value {
            OrderStatus::Active => order::Status::Active,
            OrderStatus::Completed => order::Status::Completed,
            OrderStatus::Cancelled => order::Status::Cancelled,
        }
    }
}

#[derive(Enum, Copy, Clone, Debug, Eq, PartialEq)]
pub enum StageStatus {
    Pending,
    InProgress,
    Completed,
}

impl From<stage_record::Status> for StageStatus {
    fn from(value: stage_record::Status) -> Self {
        match value {
            stage_record::Status::Pending => StageStatus::Pending,
            stage_record::Status::InProgress => StageStatus::InProgress,
            stage_record::Status::Completed => StageStatus::Completed,
        }
    }
}

#[derive(Clone, Debug, InputObject)]
pub struct NewCustomerInput {
    pub name: String,
    #[graphql(name = "mobileNumber")]
    pub mobile_number: String,
    pub password: String,
    pub role: Option<CustomerRole>,
}

#[derive(Clone, Debug, InputObject)]
pub struct NewOrderInput {
    #[graphql(name = "customerId")]
    pub customer_id: ID,
    #[graphql(name = "productName")]
    pub product_name: String,
}

#[derive(Clone, Debug, InputObject, Default)]
pub struct UpdateOrderInput {
    #[graphql(name = "productName")]
    pub product_name: Option<String>,
    #[graphql(name = "courierId")]
    pub courier_id: Option<String>,
    #[graphql(name = "courierLink")]
    pub courier_link: Option<String>,
    pub status: Option<OrderStatus>,
    #[graphql(name = "expectedVersion")]
    pub expected_version: Option<i32>,
}

#[derive(Clone, Debug, SimpleObject)]
#[graphql(name = "Customer")]
pub struct CustomerNode {
    pub id: ID,
    pub name: String,
    #[graphql(name = "mobileNumber")]
    pub mobile_number: String,
    pub role: CustomerRole,
    #[graphql(name = "createdAt")]
    pub created_at: DateTime<Utc>,
}

impl From<customer::Model> for CustomerNode {
    fn from(model: customer::Model) -> Self {
        Self {
            id: ID::from(model.id.to_string()),
            name: model.name,
            mobile_number: model.mobile_number,
            role: model.role.into(),
            created_at: model.created_at.into(),
        }
    }
}

#[derive(Clone, Debug, SimpleObject)]
#[graphql(name = "Stage")]
pub struct StageNode {
    pub number: i32,
    pub name: String,
    pub description: String,
}

impl From<&Stage> for StageNode {
    fn from(stage: &Stage) -> Self {
        Self {
            number: stage.number as i32,
            name: stage.name.to_string(),
            description: stage.description.to_string(),
        }
    }
}

#[derive(Clone, Debug, SimpleObject)]
#[graphql(name = "StageProgress")]
pub struct StageProgressNode {
    #[graphql(name = "stageNumber")]
    pub stage_number: i32,
    pub name: String,
    pub description: String,
    pub status: StageStatus,
    /// Null when no photo was attached or the caller may not see it.
    #[graphql(name = "photoRef")]
    pub photo_ref: Option<String>,
    #[graphql(name = "updatedAt")]
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, SimpleObject)]
#[graphql(name = "Order")]
pub struct OrderNode {
    pub id: ID,
    #[graphql(name = "customerId")]
    pub customer_id: ID,
    #[graphql(name = "productName")]
    pub product_name: String,
    #[graphql(name = "currentStage")]
    pub current_stage: i32,
    pub status: OrderStatus,
    #[graphql(name = "courierId")]
    pub courier_id: Option<String>,
    #[graphql(name = "courierLink")]
    pub courier_link: Option<String>,
    pub version: i32,
    #[graphql(name = "progressPercent")]
    pub progress_percent: i32,
    pub stages: Vec<StageProgressNode>,
    #[graphql(name = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[graphql(name = "updatedAt")]
    pub updated_at: DateTime<Utc>,
}

impl OrderNode {
    fn from_view(view: OrderWithStages, session: &Session) -> Self {
        let stages = view
            .stages
            .iter()
            .map(|record| {
                let meta = stages::stage(record.stage_number);
                StageProgressNode {
                    stage_number: record.stage_number as i32,
                    name: meta.map(|s| s.name).unwrap_or_default().to_string(),
                    description: meta.map(|s| s.description).unwrap_or_default().to_string(),
                    status: record.status.into(),
                    photo_ref: view.visible_photo(record, session),
                    updated_at: record.updated_at.into(),
                }
            })
            .collect();
        let progress_percent = view.progress_percent();
        let order = view.order;
        Self {
            id: ID::from(order.id.to_string()),
            customer_id: ID::from(order.customer_id.to_string()),
            product_name: order.product_name,
            current_stage: order.current_stage as i32,
            status: order.status.into(),
            courier_id: order.courier_id,
            courier_link: order.courier_link,
            version: order.version,
            progress_percent,
            stages,
            created_at: order.created_at.into(),
            updated_at: order.updated_at.into(),
        }
    }
}

#[derive(Clone, Debug, SimpleObject)]
#[graphql(name = "Bill")]
pub struct BillNode {
    pub id: ID,
    #[graphql(name = "orderId")]
    pub order_id: ID,
    #[graphql(name = "fileRef")]
    pub file_ref: String,
    #[graphql(name = "createdAt")]
    pub created_at: DateTime<Utc>,
}

impl From<bill::Model> for BillNode {
    fn from(model: bill::Model) -> Self {
        Self {
            id: ID::from(model.id.to_string()),
            order_id: ID::from(model.order_id.to_string()),
            file_ref: model.file_ref,
            created_at: model.created_at.into(),
        }
    }
}

#[derive(Clone, Debug, SimpleObject)]
pub struct MePayload {
    pub customer: CustomerNode,
    pub role: CustomerRole,
}

#[derive(Clone, Debug, SimpleObject, Default)]
pub struct AuthPayload {
    pub ok: bool,
    pub customer: Option<CustomerNode>,
    /// Same token as the session cookie, for clients sending a bearer header.
    pub token: Option<String>,
    pub error: Option<String>,
}

fn database(ctx: &Context<'_>) -> async_graphql::Result<Arc<DatabaseConnection>> {
    ctx.data::<Arc<DatabaseConnection>>()
        .cloned()
        .map_err(|_| gql_error(ApiError::internal(anyhow::anyhow!("missing database connection"))))
}

fn auth_config(ctx: &Context<'_>) -> async_graphql::Result<Arc<AuthConfig>> {
    ctx.data::<Arc<AuthConfig>>()
        .cloned()
        .map_err(|_| gql_error(ApiError::internal(anyhow::anyhow!("missing auth configuration"))))
}

fn settings(ctx: &Context<'_>) -> TrackerSettings {
    ctx.data_opt::<TrackerSettings>().copied().unwrap_or_default()
}

/// The request's session, attached by the HTTP layer after resolving the
/// token.
fn session(ctx: &Context<'_>) -> async_graphql::Result<Session> {
    ctx.data_opt::<Session>()
        .copied()
        .ok_or_else(|| gql_error(ApiError::Unauthenticated))
}

fn parse_uuid(id: &ID) -> async_graphql::Result<Uuid> {
    Uuid::parse_str(id.as_str()).map_err(|_| gql_error(ApiError::validation("invalid id")))
}

fn append_session_cookie(ctx: &Context<'_>, token: &str, ttl_minutes: i64) {
    let cookie = if ttl_minutes < 0 {
        format!("{}=; Max-Age=0; Path=/; HttpOnly; SameSite=Lax", SESSION_COOKIE)
    } else {
        format!(
            "{}={}; Max-Age={}; Path=/; HttpOnly; SameSite=Lax",
            SESSION_COOKIE,
            token,
            ttl_minutes * 60
        )
    };
    ctx.append_http_header("Set-Cookie", cookie);
}
