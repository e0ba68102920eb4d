use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use timeslot::engine::Engine;
use timeslot::wire;

const HOUR: i64 = 3_600_000;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<Engine>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("timeslot_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let engine = Arc::new(Engine::new(dir.join("timeslot.wal")).unwrap());

    let served = engine.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let engine = served.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, engine, "timeslot".to_string(), None).await;
            });
        }
    });

    (addr, engine)
}

async fn connect(addr: SocketAddr) -> Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("timeslot")
        .user("timeslot")
        .password("timeslot");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

fn rows(messages: Vec<SimpleQueryMessage>) -> Vec<SimpleQueryRow> {
    messages
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

fn sqlstate(err: &tokio_postgres::Error) -> Option<&str> {
    err.as_db_error().map(|db| db.code().code())
}

/// Start of the hour a week from now.
fn next_week() -> i64 {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64;
    (now / HOUR + 7 * 24) * HOUR
}

async fn create_room(client: &Client, name: &str) -> Ulid {
    let rid = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO resources (id, name) VALUES ('{rid}', '{name}')"
        ))
        .await
        .unwrap();
    rid
}

fn insert_reservation(rid: Ulid, who: &str, start: i64, end: i64) -> String {
    format!(
        r#"INSERT INTO reservations (resource_id, requester_id, start, "end") VALUES ('{rid}', '{who}', {start}, {end})"#
    )
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn health_reports_ok() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;

    let health = rows(client.simple_query("SELECT * FROM health").await.unwrap());
    assert_eq!(health.len(), 1);
    assert_eq!(health[0].get("status"), Some("ok"));
    assert!(health[0].get("now").unwrap().parse::<i64>().unwrap() > 0);
}

#[tokio::test]
async fn resources_are_listed_and_names_unique() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;

    create_room(&client, "Boardroom").await;
    create_room(&client, "Atrium").await;

    let err = client
        .batch_execute(&format!(
            "INSERT INTO resources (id, name) VALUES ('{}', 'Atrium')",
            Ulid::new()
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("23505"));

    let listed = rows(client.simple_query("SELECT * FROM resources").await.unwrap());
    let names: Vec<_> = listed.iter().map(|r| r.get("name").unwrap()).collect();
    assert_eq!(names, vec!["Atrium", "Boardroom"]);
}

#[tokio::test]
async fn adjacent_slots_accepted_overlap_rejected() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let rid = create_room(&client, "Room A").await;
    let t = next_week();

    client
        .batch_execute(&insert_reservation(rid, "alice", t + 10 * HOUR, t + 12 * HOUR))
        .await
        .unwrap();
    client
        .batch_execute(&insert_reservation(rid, "bob", t + 12 * HOUR, t + 14 * HOUR))
        .await
        .unwrap();

    let err = client
        .batch_execute(&insert_reservation(rid, "carol", t + 11 * HOUR, t + 13 * HOUR))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("23P01"));

    let listed = rows(
        client
            .simple_query(&format!("SELECT * FROM reservations WHERE resource_id = '{rid}'"))
            .await
            .unwrap(),
    );
    let who: Vec<_> = listed.iter().map(|r| r.get("requester_id").unwrap()).collect();
    assert_eq!(who, vec!["alice", "bob"]);
    assert_eq!(listed[0].get("total"), Some("2"));
}

#[tokio::test]
async fn returning_yields_the_stored_row() {
    let (addr, engine) = start_test_server().await;
    let client = connect(addr).await;
    let rid = create_room(&client, "Room A").await;
    let t = next_week();

    let sql = format!("{} RETURNING *", insert_reservation(rid, "alice", t, t + HOUR));
    let returned = rows(client.simple_query(&sql).await.unwrap());
    assert_eq!(returned.len(), 1);

    let id = Ulid::from_string(returned[0].get("id").unwrap()).unwrap();
    let stored = engine.get_reservation(id).await.unwrap();
    assert_eq!(stored.requester_id, "alice");
    assert_eq!(returned[0].get("start"), Some(t.to_string().as_str()));
}

#[tokio::test]
async fn invalid_requests_are_rejected_before_admission() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let rid = create_room(&client, "Room A").await;
    let t = next_week();

    let backwards = client
        .batch_execute(&insert_reservation(rid, "alice", t + HOUR, t))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&backwards), Some("22023"));

    let past = client
        .batch_execute(&insert_reservation(rid, "alice", 1_000_000_000_000, 1_000_003_600_000))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&past), Some("22023"));

    let nobody = client
        .batch_execute(&insert_reservation(rid, " ", t, t + HOUR))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&nobody), Some("22023"));

    let missing = client
        .batch_execute(&insert_reservation(Ulid::new(), "alice", t, t + HOUR))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&missing), Some("P0002"));

    let garbage = client.batch_execute("INSERT INTO nowhere VALUES (1)").await.unwrap_err();
    assert_eq!(sqlstate(&garbage), Some("42601"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_clients_get_one_reservation() {
    let (addr, engine) = start_test_server().await;
    let setup = connect(addr).await;
    let rid = create_room(&setup, "Room A").await;
    let t = next_week();

    let mut handles = Vec::new();
    for i in 0..10 {
        handles.push(tokio::spawn(async move {
            let client = connect(addr).await;
            client
                .batch_execute(&insert_reservation(
                    rid,
                    &format!("user-{i}"),
                    t + 10 * HOUR,
                    t + 12 * HOUR,
                ))
                .await
        }));
    }

    let mut created = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(()) => created += 1,
            Err(e) => {
                let code = sqlstate(&e);
                assert!(
                    code == Some("23P01") || code == Some("40001"),
                    "unexpected error: {e:?}"
                );
            }
        }
    }
    assert_eq!(created, 1);

    let rs = engine.get_resource(&rid).unwrap();
    assert_eq!(rs.read().await.reservations.len(), 1);
}

#[tokio::test]
async fn cancel_frees_the_slot() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let rid = create_room(&client, "Room A").await;
    let t = next_week();

    let sql = format!("{} RETURNING id", insert_reservation(rid, "alice", t, t + 2 * HOUR));
    let returned = rows(client.simple_query(&sql).await.unwrap());
    let id = returned[0].get("id").unwrap().to_string();

    client
        .batch_execute(&format!("DELETE FROM reservations WHERE id = '{id}'"))
        .await
        .unwrap();
    client
        .batch_execute(&insert_reservation(rid, "bob", t + HOUR, t + 3 * HOUR))
        .await
        .unwrap();

    let again = client
        .batch_execute(&format!("DELETE FROM reservations WHERE id = '{id}'"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&again), Some("P0002"));
}

#[tokio::test]
async fn listing_pages_through_reservations() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let rid = create_room(&client, "Room A").await;
    let t = next_week();

    for h in 0..12 {
        client
            .batch_execute(&insert_reservation(rid, "alice", t + h * HOUR, t + (h + 1) * HOUR))
            .await
            .unwrap();
    }

    let page2 = rows(
        client
            .simple_query("SELECT * FROM reservations WHERE page = 2 AND page_size = 5")
            .await
            .unwrap(),
    );
    assert_eq!(page2.len(), 5);
    assert_eq!(page2[0].get("start"), Some((t + 5 * HOUR).to_string().as_str()));
    assert_eq!(page2[0].get("pages"), Some("3"));
}

#[tokio::test]
async fn extended_protocol_binds_parameters() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let rid = create_room(&client, "Room A").await;
    let t = next_week();

    let inserted = client
        .execute(
            r#"INSERT INTO reservations (resource_id, requester_id, start, "end") VALUES ($1, $2, $3, $4)"#,
            &[
                &rid.to_string(),
                &"o'brien",
                &t.to_string(),
                &(t + HOUR).to_string(),
            ],
        )
        .await
        .unwrap();
    assert_eq!(inserted, 1);

    let listed = client
        .query(
            "SELECT * FROM reservations WHERE resource_id = $1",
            &[&rid.to_string()],
        )
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
    let who: &str = listed[0].get("requester_id");
    assert_eq!(who, "o'brien");
}
