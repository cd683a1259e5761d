//! Integration tests for observations, subscriptions, and value streams.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use regionwatch::{
    CallbackSink, Db, Error, ObserveOptions, Region, RegionObservation, Result, Writer,
    WriterConfig,
};

fn game() -> Writer {
    let writer = Writer::open_in_memory().unwrap();
    writer
        .write(|db| {
            db.execute_batch(
                "CREATE TABLE player (id INTEGER PRIMARY KEY, name TEXT, score INTEGER);
                 CREATE TABLE settings (id INTEGER PRIMARY KEY, value TEXT);
                 INSERT INTO settings (id, value) VALUES (1, 'easy');",
            )?;
            Ok(())
        })
        .unwrap();
    writer
}

fn insert_player(writer: &Writer, name: &str) {
    writer
        .write(|db| {
            db.execute("INSERT INTO player (name, score) VALUES (?1, 0)", [name])?;
            Ok(())
        })
        .unwrap();
}

fn player_count(db: &Db<'_>) -> Result<i64> {
    Ok(db.query_row("SELECT COUNT(*) FROM player", [], |r| r.get(0))?)
}

fn counter(writer: &Writer, region: Region) -> (regionwatch::RegistrationHandle, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    let handle = RegionObservation::from(region)
        .start(writer, move |_db| {
            seen.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    (handle, calls)
}

#[test]
fn test_player_scenario_callbacks() {
    let writer = game();
    let (_handle, calls) = counter(&writer, Region::table("player"));

    insert_player(&writer, "ann");
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    writer
        .write(|db| {
            db.execute("UPDATE settings SET value = 'hard' WHERE id = 1", [])?;
            Ok(())
        })
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    writer
        .write(|db| {
            db.execute("INSERT INTO player (name, score) VALUES ('bob', 1)", [])?;
            db.execute("UPDATE player SET score = 2 WHERE name = 'bob'", [])?;
            Ok(())
        })
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_player_scenario_stream() {
    let writer = game();
    for name in ["ann", "bob", "cid"] {
        insert_player(&writer, name);
    }

    let mut counts = RegionObservation::from(Region::table("player")).values(
        &writer,
        ObserveOptions::default(),
        player_count,
    );
    assert_eq!(counts.try_next().unwrap().unwrap(), 3);
    assert!(counts.try_next().is_none());

    insert_player(&writer, "dan");
    assert_eq!(counts.try_next().unwrap().unwrap(), 4);
    assert!(counts.try_next().is_none());
}

#[test]
fn test_rollback_never_notifies() {
    let writer = game();
    let (_handle, calls) = counter(&writer, Region::table("player"));

    let result: Result<()> = writer.write(|db| {
        db.execute("INSERT INTO player (name) VALUES ('ann')", [])?;
        Err(Error::Disconnected)
    });
    assert!(result.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_rolled_back_savepoint_does_not_touch() {
    let writer = game();
    let (_handle, calls) = counter(&writer, Region::table("player"));

    writer
        .write(|db| {
            let _ = db.reentrant_write(|db| -> Result<()> {
                db.execute("INSERT INTO player (name) VALUES ('ann')", [])?;
                Err(Error::Disconnected)
            });
            db.execute("UPDATE settings SET value = 'hard'", [])?;
            Ok(())
        })
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_column_region() {
    let writer = game();
    insert_player(&writer, "ann");
    let observation = RegionObservation::new().tracking_sql("SELECT score FROM player");
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    let _handle = observation
        .start(&writer, move |_db| {
            seen.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    writer
        .write(|db| {
            db.execute("UPDATE player SET name = 'anna'", [])?;
            Ok(())
        })
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    writer
        .write(|db| {
            db.execute("UPDATE player SET score = score + 1", [])?;
            Ok(())
        })
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Deleting every row is seen even though no column is named.
    writer
        .write(|db| {
            db.execute("DELETE FROM player", [])?;
            Ok(())
        })
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_without_rowid_table() {
    let writer = game();
    writer
        .write(|db| {
            db.execute_batch("CREATE TABLE kv (k TEXT PRIMARY KEY, v TEXT) WITHOUT ROWID")?;
            Ok(())
        })
        .unwrap();

    let mut values = RegionObservation::new()
        .tracking_sql("SELECT v FROM kv WHERE k = 'volume'")
        .values(&writer, ObserveOptions::changes_only(), |db| {
            Ok(db.query_row("SELECT COUNT(*) FROM kv", [], |r| r.get::<_, i64>(0))?)
        });
    let (_whole, calls) = counter(&writer, Region::table("kv"));

    writer
        .write(|db| {
            db.execute("INSERT INTO kv (k, v) VALUES ('volume', '3')", [])?;
            Ok(())
        })
        .unwrap();
    assert_eq!(values.try_next().unwrap().unwrap(), 1);

    writer
        .write(|db| {
            db.execute("UPDATE kv SET v = '4' WHERE k = 'volume'", [])?;
            Ok(())
        })
        .unwrap();
    assert_eq!(values.try_next().unwrap().unwrap(), 1);

    writer
        .write(|db| {
            db.execute("DELETE FROM kv", [])?;
            Ok(())
        })
        .unwrap();
    assert_eq!(values.try_next().unwrap().unwrap(), 0);
    assert!(values.try_next().is_none());
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[test]
fn test_changes_only() {
    let writer = game();
    let mut counts = RegionObservation::from(Region::table("player")).values(
        &writer,
        ObserveOptions::changes_only(),
        player_count,
    );
    assert!(counts.try_next().is_none());

    insert_player(&writer, "ann");
    assert_eq!(counts.try_next().unwrap().unwrap(), 1);
}

#[test]
fn test_remove_before_commit_never_notifies() {
    let writer = game();
    let (handle, calls) = counter(&writer, Region::table("player"));
    handle.remove();

    insert_player(&writer, "ann");
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(writer.observer_count(), 0);
}

#[test]
fn test_observers_are_independent() {
    let writer = game();
    let (_players, player_calls) = counter(&writer, Region::table("player"));
    let (_settings, settings_calls) = counter(&writer, Region::table("settings"));

    // A failing subscription does not affect the others.
    let failed = RegionObservation::new()
        .tracking_sql("SELECT * FROM missing")
        .values(&writer, ObserveOptions::default(), player_count);
    assert!(!failed.subscription().is_active());

    insert_player(&writer, "ann");
    assert_eq!(player_calls.load(Ordering::SeqCst), 1);
    assert_eq!(settings_calls.load(Ordering::SeqCst), 0);
    assert_eq!(writer.observer_count(), 2);
}

#[test]
fn test_registration_failure() {
    let writer = game();
    writer.close().unwrap();

    let errors = Arc::new(Mutex::new(Vec::new()));
    let seen = errors.clone();
    let subscription = RegionObservation::from(Region::table("player")).observe(
        &writer,
        ObserveOptions::default(),
        CallbackSink::new(
            |_db: &Db<'_>| Ok(()),
            move |err: Error| seen.lock().push(err),
        ),
    );

    assert!(!subscription.is_active());
    let errors = errors.lock();
    assert_eq!(errors.len(), 1);
    assert!(matches!(&errors[0], Error::Registration(inner) if inner.is_closed()));
}

#[test]
fn test_callback_failure_ends_subscription() {
    let writer = game();
    let nexts = Arc::new(AtomicUsize::new(0));
    let errors = Arc::new(Mutex::new(Vec::new()));

    let seen_nexts = nexts.clone();
    let seen_errors = errors.clone();
    let subscription = RegionObservation::from(Region::table("player")).observe(
        &writer,
        ObserveOptions::default(),
        CallbackSink::new(
            move |db: &Db<'_>| {
                seen_nexts.fetch_add(1, Ordering::SeqCst);
                if player_count(db)? > 0 {
                    return Err(Error::Disconnected);
                }
                Ok(())
            },
            move |err: Error| seen_errors.lock().push(err.to_string()),
        ),
    );
    assert_eq!(nexts.load(Ordering::SeqCst), 1);

    insert_player(&writer, "ann");
    insert_player(&writer, "bob");

    assert_eq!(nexts.load(Ordering::SeqCst), 2);
    assert_eq!(
        *errors.lock(),
        vec!["callback failed: subscriber disconnected".to_string()]
    );
    assert!(!subscription.is_active());
    assert_eq!(writer.observer_count(), 0);

    // The writer is unaffected.
    insert_player(&writer, "cid");
}

#[test]
fn test_close_ends_stream() {
    let writer = game();
    let mut counts = RegionObservation::from(Region::table("player")).values(
        &writer,
        ObserveOptions::default(),
        player_count,
    );
    assert_eq!(counts.try_next().unwrap().unwrap(), 0);

    writer.close().unwrap();
    assert!(matches!(counts.try_next(), Some(Err(Error::Closed))));
    assert!(counts.try_next().is_none());
    assert!(!counts.subscription().is_active());
}

#[test]
fn test_cancel_stops_notifications() {
    let writer = game();
    let mut counts = RegionObservation::from(Region::table("player")).values(
        &writer,
        ObserveOptions::changes_only(),
        player_count,
    );

    insert_player(&writer, "ann");
    counts.cancel();
    insert_player(&writer, "bob");

    assert_eq!(counts.try_next().unwrap().unwrap(), 1);
    assert!(counts.try_next().is_none());
    assert_eq!(writer.observer_count(), 0);
}

#[test]
fn test_dropping_subscription_cancels() {
    let writer = game();
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();

    let subscription = RegionObservation::from(Region::table("player")).observe(
        &writer,
        ObserveOptions::changes_only(),
        CallbackSink::new(
            move |_db: &Db<'_>| {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            |_err: Error| {},
        ),
    );
    assert_eq!(writer.observer_count(), 1);
    drop(subscription);
    assert_eq!(writer.observer_count(), 0);

    insert_player(&writer, "ann");
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_callback_writes_through_reentrant_write() {
    let writer = game();
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();

    let _handle = RegionObservation::from(Region::table("player"))
        .start(&writer, move |db| {
            seen.fetch_add(1, Ordering::SeqCst);
            assert!(matches!(
                db.writer().write(|_db| Ok(())),
                Err(Error::ReentrantWrite)
            ));
            db.reentrant_write(|db| {
                db.execute("UPDATE settings SET value = 'changed' WHERE id = 1", [])?;
                Ok(())
            })
            .unwrap();
        })
        .unwrap();
    let (_settings, settings_calls) = counter(&writer, Region::table("settings"));

    insert_player(&writer, "ann");

    // The callback's own write does not notify it again, but notifies others.
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(settings_calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_cancel_waits_for_callback_in_flight() {
    let writer = game();
    let (entered_tx, entered_rx) = mpsc::channel();
    let finished = Arc::new(AtomicBool::new(false));
    let calls = Arc::new(AtomicUsize::new(0));

    let flag = finished.clone();
    let seen = calls.clone();
    let entered_tx = Mutex::new(entered_tx);
    let handle = RegionObservation::from(Region::table("player"))
        .start(&writer, move |_db| {
            seen.fetch_add(1, Ordering::SeqCst);
            entered_tx.lock().send(()).unwrap();
            thread::sleep(Duration::from_millis(100));
            flag.store(true, Ordering::SeqCst);
        })
        .unwrap();

    let background = writer.clone();
    let worker = thread::spawn(move || insert_player(&background, "ann"));

    entered_rx.recv().unwrap();
    handle.remove();
    assert!(finished.load(Ordering::SeqCst));
    worker.join().unwrap();

    insert_player(&writer, "bob");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_initial_emission_precedes_later_writes() {
    let dir = tempfile::tempdir().unwrap();
    let writer = Writer::open(WriterConfig::new(dir.path().join("game.sqlite"))).unwrap();
    writer
        .write(|db| {
            db.execute_batch("CREATE TABLE player (id INTEGER PRIMARY KEY, name TEXT)")?;
            Ok(())
        })
        .unwrap();

    let background = writer.clone();
    let worker = thread::spawn(move || {
        for i in 0..20 {
            insert_player(&background, &format!("p{i}"));
        }
    });

    let mut counts = RegionObservation::from(Region::table("player")).values(
        &writer,
        ObserveOptions::default(),
        player_count,
    );
    worker.join().unwrap();

    // Every emission after the first reports exactly one more player.
    let mut seen = Vec::new();
    while let Some(count) = counts.try_next() {
        seen.push(count.unwrap());
    }
    assert!(!seen.is_empty());
    assert_eq!(*seen.last().unwrap(), 20);
    for pair in seen.windows(2) {
        assert_eq!(pair[1], pair[0] + 1);
    }
}

#[tokio::test]
async fn test_stream_with_tokio() {
    let writer = game();
    let mut counts = RegionObservation::new()
        .tracking_sql("SELECT COUNT(*) FROM player")
        .values(&writer, ObserveOptions::default(), player_count);

    assert_eq!(counts.next().await.unwrap().unwrap(), 0);

    let background = writer.clone();
    tokio::task::spawn_blocking(move || insert_player(&background, "ann"))
        .await
        .unwrap();
    assert_eq!(counts.next().await.unwrap().unwrap(), 1);

    drop(counts);
    assert_eq!(writer.observer_count(), 0);
}
