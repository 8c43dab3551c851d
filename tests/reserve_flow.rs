use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Config, NoTls, SimpleQueryMessage};
use ulid::Ulid;

use atelier::engine::{day_of_week, day_start};
use atelier::model::{Ms, DAY_MS, HOUR_MS};
use atelier::tenant::TenantManager;
use atelier::wire;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<TenantManager>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("atelier_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let tm = Arc::new(TenantManager::new(dir, 1000, 7 * DAY_MS));

    let tm2 = tm.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let tm = tm2.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, tm, "atelier".to_string(), None).await;
            });
        }
    });

    (addr, tm)
}

async fn connect(addr: SocketAddr, user: &str) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("test")
        .user(user)
        .password("atelier");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as Ms
}

/// Midnight of the next occurrence of `dow` strictly after today.
fn next_day_start(dow: u8) -> Ms {
    let mut day = day_start(now_ms()) + DAY_MS;
    while day_of_week(day) != dow {
        day += DAY_MS;
    }
    day
}

fn data_rows(messages: &[SimpleQueryMessage]) -> Vec<&tokio_postgres::SimpleQueryRow> {
    messages
        .iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

fn command_rows(messages: &[SimpleQueryMessage]) -> u64 {
    messages
        .iter()
        .find_map(|m| match m {
            SimpleQueryMessage::CommandComplete(n) => Some(*n),
            _ => None,
        })
        .expect("expected a command tag")
}

fn expect_sqlstate(err: tokio_postgres::Error, code: &str) {
    let db = err.as_db_error().expect("expected a database error");
    assert_eq!(db.code().code(), code, "unexpected SQLSTATE: {db:?}");
}

struct Boutique {
    owner_id: Ulid,
    owner: tokio_postgres::Client,
}

/// Register an owner with a Monday 08:00-12:00 template and four
/// materialized one-hour slots; returns the slot ids sorted by start.
async fn seed_boutique(addr: SocketAddr) -> (Boutique, Vec<String>, Ms) {
    let owner_id = Ulid::new();
    let owner = connect(addr, &format!("owner_{owner_id}")).await;

    owner
        .batch_execute(&format!(
            "INSERT INTO owners (id, name, slot_len, auto_confirm) VALUES ('{owner_id}', 'Maison Fitte', {HOUR_MS}, true)"
        ))
        .await
        .unwrap();
    owner
        .batch_execute(&format!(
            r#"INSERT INTO templates (owner_id, day, enabled, "open", "close") VALUES ('{owner_id}', 1, true, {}, {})"#,
            8 * HOUR_MS,
            12 * HOUR_MS,
        ))
        .await
        .unwrap();

    let monday = next_day_start(1);
    let messages = owner
        .simple_query(&format!(
            "MATERIALIZE '{owner_id}' FROM {monday} TO {}",
            monday + DAY_MS
        ))
        .await
        .unwrap();
    assert_eq!(command_rows(&messages), 4);

    let messages = owner
        .simple_query(&format!(
            "SELECT * FROM slots WHERE owner_id = '{owner_id}' AND available = true"
        ))
        .await
        .unwrap();
    let slot_ids: Vec<String> = data_rows(&messages)
        .iter()
        .map(|row| row.get(0).unwrap().to_string())
        .collect();
    assert_eq!(slot_ids.len(), 4);

    (Boutique { owner_id, owner }, slot_ids, monday)
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn booking_flow_reserve_conflict_cancel() {
    let (addr, _tm) = start_test_server().await;
    let (boutique, slots, _) = seed_boutique(addr).await;
    let owner_id = boutique.owner_id;
    let nine = &slots[1];

    // Customer A reserves the 09:00 slot.
    let customer_a = Ulid::new();
    let client_a = connect(addr, &format!("customer_{customer_a}")).await;
    let schedule_a = Ulid::new();
    client_a
        .batch_execute(&format!(
            "INSERT INTO schedules (id, slot_id, customer_id) VALUES ('{schedule_a}', '{nine}', '{customer_a}')"
        ))
        .await
        .unwrap();

    // Customer B collides on the same slot and must see AlreadyBooked.
    let customer_b = Ulid::new();
    let client_b = connect(addr, &format!("customer_{customer_b}")).await;
    let err = client_b
        .batch_execute(&format!(
            "INSERT INTO schedules (id, slot_id, customer_id) VALUES ('{}', '{nine}', '{customer_b}')",
            Ulid::new()
        ))
        .await
        .unwrap_err();
    expect_sqlstate(err, "55006");

    // Availability reflects the reservation.
    let messages = boutique
        .owner
        .simple_query(&format!(
            "SELECT * FROM slots WHERE owner_id = '{owner_id}' AND available = true"
        ))
        .await
        .unwrap();
    assert_eq!(data_rows(&messages).len(), 3);

    // A cancels; the slot frees up and B can take it.
    client_a
        .batch_execute(&format!(
            "UPDATE schedules SET status = 'cancelled' WHERE id = '{schedule_a}'"
        ))
        .await
        .unwrap();
    let messages = boutique
        .owner
        .simple_query(&format!(
            "SELECT * FROM slots WHERE owner_id = '{owner_id}' AND available = true"
        ))
        .await
        .unwrap();
    assert_eq!(data_rows(&messages).len(), 4);

    client_b
        .batch_execute(&format!(
            "INSERT INTO schedules (id, slot_id, customer_id) VALUES ('{}', '{nine}', '{customer_b}')",
            Ulid::new()
        ))
        .await
        .unwrap();
}

#[tokio::test]
async fn materialize_is_idempotent_over_the_wire() {
    let (addr, _tm) = start_test_server().await;
    let (boutique, _, monday) = seed_boutique(addr).await;
    let owner_id = boutique.owner_id;

    let messages = boutique
        .owner
        .simple_query(&format!(
            "MATERIALIZE '{owner_id}' FROM {monday} TO {}",
            monday + DAY_MS
        ))
        .await
        .unwrap();
    assert_eq!(command_rows(&messages), 0);
}

#[tokio::test]
async fn owner_transitions_to_completed_then_terminal() {
    let (addr, _tm) = start_test_server().await;
    let (boutique, slots, _) = seed_boutique(addr).await;

    let customer_id = Ulid::new();
    let customer = connect(addr, &format!("customer_{customer_id}")).await;
    let schedule_id = Ulid::new();
    customer
        .batch_execute(&format!(
            "INSERT INTO schedules (id, slot_id, customer_id) VALUES ('{schedule_id}', '{}', '{customer_id}')",
            slots[0]
        ))
        .await
        .unwrap();

    for status in ["in_progress", "completed"] {
        boutique
            .owner
            .batch_execute(&format!(
                "UPDATE schedules SET status = '{status}' WHERE id = '{schedule_id}'"
            ))
            .await
            .unwrap();
    }

    let err = boutique
        .owner
        .batch_execute(&format!(
            "UPDATE schedules SET status = 'in_progress' WHERE id = '{schedule_id}'"
        ))
        .await
        .unwrap_err();
    expect_sqlstate(err, "P0001");

    let messages = boutique
        .owner
        .simple_query(&format!("SELECT * FROM schedules WHERE id = '{schedule_id}'"))
        .await
        .unwrap();
    let rows = data_rows(&messages);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get(4), Some("completed"));
}

#[tokio::test]
async fn reschedule_moves_booking_over_the_wire() {
    let (addr, _tm) = start_test_server().await;
    let (boutique, slots, _) = seed_boutique(addr).await;
    let owner_id = boutique.owner_id;
    let (ten, eleven) = (&slots[2], &slots[3]);

    let customer_id = Ulid::new();
    let customer = connect(addr, &format!("customer_{customer_id}")).await;
    let schedule_id = Ulid::new();
    customer
        .batch_execute(&format!(
            "INSERT INTO schedules (id, slot_id, customer_id) VALUES ('{schedule_id}', '{ten}', '{customer_id}')"
        ))
        .await
        .unwrap();

    customer
        .batch_execute(&format!(
            "UPDATE schedules SET slot_id = '{eleven}' WHERE id = '{schedule_id}'"
        ))
        .await
        .unwrap();

    let messages = customer
        .simple_query(&format!("SELECT * FROM schedules WHERE id = '{schedule_id}'"))
        .await
        .unwrap();
    assert_eq!(data_rows(&messages)[0].get(2), Some(eleven.as_str()));

    // The vacated 10:00 slot is available again; 11:00 is not.
    let messages = boutique
        .owner
        .simple_query(&format!(
            "SELECT * FROM slots WHERE owner_id = '{owner_id}' AND available = true"
        ))
        .await
        .unwrap();
    let available: Vec<String> = data_rows(&messages)
        .iter()
        .map(|row| row.get(0).unwrap().to_string())
        .collect();
    assert!(available.contains(ten));
    assert!(!available.contains(eleven));
}

#[tokio::test]
async fn reschedule_to_taken_slot_fails_atomically() {
    let (addr, _tm) = start_test_server().await;
    let (_boutique, slots, _) = seed_boutique(addr).await;
    let (nine, ten) = (&slots[1], &slots[2]);

    let customer_a = Ulid::new();
    let client_a = connect(addr, &format!("customer_{customer_a}")).await;
    let schedule_a = Ulid::new();
    client_a
        .batch_execute(&format!(
            "INSERT INTO schedules (id, slot_id, customer_id) VALUES ('{schedule_a}', '{nine}', '{customer_a}')"
        ))
        .await
        .unwrap();

    let customer_b = Ulid::new();
    let client_b = connect(addr, &format!("customer_{customer_b}")).await;
    client_b
        .batch_execute(&format!(
            "INSERT INTO schedules (id, slot_id, customer_id) VALUES ('{}', '{ten}', '{customer_b}')",
            Ulid::new()
        ))
        .await
        .unwrap();

    let err = client_a
        .batch_execute(&format!(
            "UPDATE schedules SET slot_id = '{ten}' WHERE id = '{schedule_a}'"
        ))
        .await
        .unwrap_err();
    expect_sqlstate(err, "55006");

    // The schedule still points at its original slot.
    let messages = client_a
        .simple_query(&format!("SELECT * FROM schedules WHERE id = '{schedule_a}'"))
        .await
        .unwrap();
    assert_eq!(data_rows(&messages)[0].get(2), Some(nine.as_str()));
}

#[tokio::test]
async fn authorization_is_enforced_over_the_wire() {
    let (addr, _tm) = start_test_server().await;
    let (boutique, slots, _) = seed_boutique(addr).await;
    let owner_id = boutique.owner_id;

    // A customer cannot touch the owner's templates.
    let customer_id = Ulid::new();
    let customer = connect(addr, &format!("customer_{customer_id}")).await;
    let err = customer
        .batch_execute(&format!(
            r#"INSERT INTO templates (owner_id, day, enabled, "open", "close") VALUES ('{owner_id}', 2, true, 0, {HOUR_MS})"#
        ))
        .await
        .unwrap_err();
    expect_sqlstate(err, "42501");

    // Nor book in someone else's name.
    let err = customer
        .batch_execute(&format!(
            "INSERT INTO schedules (id, slot_id, customer_id) VALUES ('{}', '{}', '{}')",
            Ulid::new(),
            slots[0],
            Ulid::new()
        ))
        .await
        .unwrap_err();
    expect_sqlstate(err, "42501");

    // A stranger cannot cancel an existing booking.
    let schedule_id = Ulid::new();
    customer
        .batch_execute(&format!(
            "INSERT INTO schedules (id, slot_id, customer_id) VALUES ('{schedule_id}', '{}', '{customer_id}')",
            slots[0]
        ))
        .await
        .unwrap();
    let stranger = connect(addr, &format!("customer_{}", Ulid::new())).await;
    let err = stranger
        .batch_execute(&format!(
            "UPDATE schedules SET status = 'cancelled' WHERE id = '{schedule_id}'"
        ))
        .await
        .unwrap_err();
    expect_sqlstate(err, "42501");
}

#[tokio::test]
async fn booked_slot_cannot_be_edited_or_deleted() {
    let (addr, _tm) = start_test_server().await;
    let (boutique, slots, monday) = seed_boutique(addr).await;
    let eight = &slots[0];

    let customer_id = Ulid::new();
    let customer = connect(addr, &format!("customer_{customer_id}")).await;
    customer
        .batch_execute(&format!(
            "INSERT INTO schedules (id, slot_id, customer_id) VALUES ('{}', '{eight}', '{customer_id}')",
            Ulid::new()
        ))
        .await
        .unwrap();

    let err = boutique
        .owner
        .batch_execute(&format!(
            "UPDATE slots SET start = {} WHERE id = '{eight}'",
            monday + 13 * HOUR_MS
        ))
        .await
        .unwrap_err();
    expect_sqlstate(err, "55006");

    let err = boutique
        .owner
        .batch_execute(&format!("DELETE FROM slots WHERE id = '{eight}'"))
        .await
        .unwrap_err();
    expect_sqlstate(err, "55006");
}

#[tokio::test]
async fn bad_login_name_is_rejected_per_query() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "admin").await;
    let err = client.batch_execute("SELECT * FROM owners").await.unwrap_err();
    expect_sqlstate(err, "28000");
}

#[tokio::test]
async fn unknown_table_is_a_syntax_error() {
    let (addr, _tm) = start_test_server().await;
    let owner_id = Ulid::new();
    let client = connect(addr, &format!("owner_{owner_id}")).await;
    let err = client
        .batch_execute(&format!("INSERT INTO bookings (id) VALUES ('{}')", Ulid::new()))
        .await
        .unwrap_err();
    expect_sqlstate(err, "42601");
}

#[tokio::test]
async fn tenants_are_isolated() {
    let (addr, _tm) = start_test_server().await;
    let (boutique, _, _) = seed_boutique(addr).await;
    let owner_id = boutique.owner_id;

    // Same owner id queried from a different tenant database.
    let mut config = Config::new();
    config
        .host("127.0.0.1")
        .port(addr.port())
        .dbname("other_tenant")
        .user(&format!("owner_{owner_id}"))
        .password("atelier");
    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });

    let messages = client
        .simple_query(&format!("SELECT * FROM slots WHERE owner_id = '{owner_id}'"))
        .await
        .unwrap();
    assert!(data_rows(&messages).is_empty());
}
