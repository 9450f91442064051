mod common;

use api::auth::Role;
use api::customers::{self, NewCustomer};
use api::orders::{self, NewOrder};
use common::{new_customer, TestEnv, ADMIN_MOBILE, ADMIN_PASSWORD, CUSTOMER_PASSWORD};
use entity::{bill, order, stage_record};
use sea_orm::{ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter};
use uuid::Uuid;

#[tokio::test]
async fn duplicate_mobile_number_is_a_conflict() {
    let env = TestEnv::new().await;
    let err = customers::create_customer(
        env.db.as_ref(),
        &env.admin_session(),
        new_customer("Alice again", "9000000001"),
    )
    .await
    .unwrap_err();
    assert_eq!(err.code(), "CONFLICT");
}

#[tokio::test]
async fn required_fields_are_enforced() {
    let env = TestEnv::new().await;
    let admin = env.admin_session();
    for input in [
        NewCustomer {
            name: " ".into(),
            ..new_customer("x", "9000000010")
        },
        NewCustomer {
            mobile_number: String::new(),
            ..new_customer("Carol", "")
        },
        NewCustomer {
            password: String::new(),
            ..new_customer("Carol", "9000000011")
        },
    ] {
        let err = customers::create_customer(env.db.as_ref(), &admin, input)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION");
    }
}

#[tokio::test]
async fn customers_cannot_manage_customers() {
    let env = TestEnv::new().await;
    let alice = env.alice_session();
    let create = customers::create_customer(
        env.db.as_ref(),
        &alice,
        new_customer("Mallory", "9000000099"),
    )
    .await
    .unwrap_err();
    assert_eq!(create.code(), "FORBIDDEN");

    let list = customers::list_customers(env.db.as_ref(), &alice, None)
        .await
        .unwrap_err();
    assert_eq!(list.code(), "FORBIDDEN");

    let delete = customers::delete_customer(env.db.as_ref(), &alice, env.bob.id)
        .await
        .unwrap_err();
    assert_eq!(delete.code(), "FORBIDDEN");
}

#[tokio::test]
async fn list_filters_by_role() {
    let env = TestEnv::new().await;
    let admin = env.admin_session();
    let users = customers::list_customers(env.db.as_ref(), &admin, Some(Role::User))
        .await
        .unwrap();
    assert_eq!(users.len(), 2);
    let admins = customers::list_customers(env.db.as_ref(), &admin, Some(Role::Admin))
        .await
        .unwrap();
    assert_eq!(admins.len(), 1);
    assert_eq!(admins[0].mobile_number, ADMIN_MOBILE);
}

#[tokio::test]
async fn authenticate_checks_the_password() {
    let env = TestEnv::new().await;
    let ok = customers::authenticate(env.db.as_ref(), " 9000000001 ", CUSTOMER_PASSWORD)
        .await
        .unwrap();
    assert_eq!(ok.map(|c| c.id), Some(env.alice.id));

    let wrong = customers::authenticate(env.db.as_ref(), "9000000001", "nope")
        .await
        .unwrap();
    assert!(wrong.is_none());

    let unknown = customers::authenticate(env.db.as_ref(), "9111111111", CUSTOMER_PASSWORD)
        .await
        .unwrap();
    assert!(unknown.is_none());
}

#[tokio::test]
async fn seed_admin_is_idempotent() {
    let env = TestEnv::new().await;
    let (again, created) =
        customers::seed_admin(env.db.as_ref(), "Admin", ADMIN_MOBILE, ADMIN_PASSWORD)
            .await
            .unwrap();
    assert!(!created);
    assert_eq!(again.id, env.admin.id);
}

#[tokio::test]
async fn deleting_a_customer_cascades_to_their_orders() {
    let env = TestEnv::new().await;
    let admin = env.admin_session();
    let alice_order = orders::create_order(
        env.db.as_ref(),
        &admin,
        NewOrder {
            customer_id: env.alice.id,
            product_name: "Bangle".into(),
        },
    )
    .await
    .unwrap();
    orders::add_bill(env.db.as_ref(), &admin, alice_order.order.id, "/files/b")
        .await
        .unwrap();
    let bob_order = orders::create_order(
        env.db.as_ref(),
        &admin,
        NewOrder {
            customer_id: env.bob.id,
            product_name: "Anklet".into(),
        },
    )
    .await
    .unwrap();

    let removed = customers::delete_customer(env.db.as_ref(), &admin, env.alice.id)
        .await
        .unwrap();
    assert!(removed);

    let db = env.db.as_ref();
    assert_eq!(order::Entity::find().count(db).await.unwrap(), 1);
    let left = stage_record::Entity::find()
        .filter(stage_record::Column::OrderId.eq(alice_order.order.id))
        .count(db)
        .await
        .unwrap();
    assert_eq!(left, 0);
    assert_eq!(bill::Entity::find().count(db).await.unwrap(), 0);
    let bobs = stage_record::Entity::find()
        .filter(stage_record::Column::OrderId.eq(bob_order.order.id))
        .count(db)
        .await
        .unwrap();
    assert_eq!(bobs, 5);

    let err = customers::delete_customer(db, &admin, env.alice.id)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "NOT_FOUND");
}

#[tokio::test]
async fn admin_cannot_delete_own_account() {
    let env = TestEnv::new().await;
    let err = customers::delete_customer(env.db.as_ref(), &env.admin_session(), env.admin.id)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "VALIDATION");

    let missing = customers::delete_customer(env.db.as_ref(), &env.admin_session(), Uuid::new_v4())
        .await
        .unwrap_err();
    assert_eq!(missing.code(), "NOT_FOUND");
}
