#![allow(dead_code)]

use std::sync::Arc;

use api::auth::{AuthConfig, Role, Session};
use api::customers::{self, NewCustomer};
use api::orders::TrackerSettings;
use api::schema::{build_schema, AppSchema, TrackerSchema};
use async_graphql::{Request, Response, ServerError, Value as GqlValue, Variables};
use entity::customer;
use migration::{Migrator, MigratorTrait};
use sea_orm::{Database, DatabaseConnection};
use serde_json::Value;

pub const ADMIN_MOBILE: &str = "9999999999";
pub const ADMIN_PASSWORD: &str = "9999999999";
pub const CUSTOMER_PASSWORD: &str = "ring-lover";

pub struct TestEnv {
    pub db: Arc<DatabaseConnection>,
    pub schema: TrackerSchema,
    pub settings: TrackerSettings,
    pub admin: customer::Model,
    pub alice: customer::Model,
    pub bob: customer::Model,
}

impl TestEnv {
    pub async fn new() -> Self {
        Self::with_settings(TrackerSettings::default()).await
    }

    pub async fn with_settings(settings: TrackerSettings) -> Self {
        let conn = Database::connect("sqlite::memory:").await.unwrap();
        Migrator::up(&conn, None).await.unwrap();
        let db = Arc::new(conn);

        let (admin, created) =
            customers::seed_admin(db.as_ref(), "Admin", ADMIN_MOBILE, ADMIN_PASSWORD)
                .await
                .unwrap();
        assert!(created);
        let admin_session = Session::from(&admin);
        let alice = customers::create_customer(
            db.as_ref(),
            &admin_session,
            new_customer("Alice", "9000000001"),
        )
        .await
        .unwrap();
        let bob = customers::create_customer(
            db.as_ref(),
            &admin_session,
            new_customer("Bob", "9000000002"),
        )
        .await
        .unwrap();

        let auth = Arc::new(AuthConfig {
            jwt_secret: "integration-secret".into(),
            session_ttl_minutes: 30,
        });
        let AppSchema(schema) = build_schema(db.clone(), auth, settings);

        Self {
            db,
            schema,
            settings,
            admin,
            alice,
            bob,
        }
    }

    pub fn admin_session(&self) -> Session {
        Session::from(&self.admin)
    }

    pub fn alice_session(&self) -> Session {
        Session::from(&self.alice)
    }

    pub fn bob_session(&self) -> Session {
        Session::from(&self.bob)
    }

    pub async fn exec(&self, session: Option<Session>, query: &str, vars: Value) -> Response {
        let mut request = Request::new(query).variables(Variables::from_json(vars));
        if let Some(session) = session {
            request = request.data(session);
        }
        self.schema.execute(request).await
    }
}

pub fn new_customer(name: &str, mobile: &str) -> NewCustomer {
    NewCustomer {
        name: name.into(),
        mobile_number: mobile.into(),
        password: CUSTOMER_PASSWORD.into(),
        role: Role::User,
    }
}

pub fn data(resp: Response) -> Value {
    assert!(resp.errors.is_empty(), "errors: {:?}", resp.errors);
    resp.data.into_json().unwrap()
}

pub fn has_error_code(errors: &[ServerError], code: &str) -> bool {
    errors
        .iter()
        .any(|e| matches_code(e.extensions.as_ref(), code))
}

fn matches_code(values: Option<&async_graphql::ErrorExtensionValues>, code: &str) -> bool {
    match values.and_then(|ext| ext.get("code")) {
        Some(GqlValue::String(s)) => s == code,
        Some(GqlValue::Enum(name)) => name.as_str() == code,
        _ => false,
    }
}
