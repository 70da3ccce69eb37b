use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::{Datelike, Days, NaiveDate, Weekday};

use slotsync::backend::{BackendError, LocalBackend, ReservationBackend, Schedule};
use slotsync::clock::Clock;
use slotsync::model::*;
use slotsync::wire::{BookingRequest, Customer, DeselectRequest, PollRequest, SelectRequest};

// 2025-09-19T08:00:00Z
const START: Ms = 1_758_268_800_000;
const TTL: Ms = 600_000;

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.3}ms, p50={:.3}ms, p95={:.3}ms, p99={:.3}ms, max={:.3}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies.last().unwrap().as_secs_f64() * 1000.0,
    );
}

fn backend() -> Arc<LocalBackend> {
    Arc::new(LocalBackend::new(Schedule::default(), TTL, Clock::manual(START)))
}

/// Open days after the start date, skipping Sundays.
fn open_days(n: usize) -> Vec<NaiveDate> {
    let first = NaiveDate::from_ymd_opt(2025, 9, 20).unwrap();
    (0..)
        .filter_map(|d| first.checked_add_days(Days::new(d)))
        .filter(|d| d.weekday() != Weekday::Sun)
        .take(n)
        .collect()
}

fn customer(i: usize) -> Customer {
    Customer {
        name: format!("visitor {i}"),
        email: format!("visitor{i}@example.com"),
        phone: None,
        notes: None,
    }
}

fn booking(key: SlotKey, i: usize) -> BookingRequest {
    BookingRequest {
        service_id: 1,
        slot_key: key,
        customer: customer(i),
        client_id: None,
        idempotency_key: IdempotencyKey::generate(),
    }
}

async fn phase1_select_cycle(backend: &LocalBackend) {
    let scope = Scope::new(open_days(1)[0], EmployeeId(1));
    let times = backend.schedule().slot_times();
    let client = ClientId::generate();

    let n = 5000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let key = scope.slot(times[i % times.len()]);
        let t = Instant::now();
        backend
            .select_slot(SelectRequest { slot_key: key, client_id: client })
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }
    backend
        .deselect_slot(DeselectRequest {
            slot_key: scope.slot(times[(n - 1) % times.len()]),
            client_id: Some(client),
        })
        .await
        .unwrap();

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} selects in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("select latency", &mut latencies);
}

async fn phase2_contended_select(backend: Arc<LocalBackend>) {
    let days = open_days(20);
    let times = backend.schedule().slot_times();
    let n_clients = 32;

    let start = Instant::now();
    let mut won = 0;
    let mut rejected = 0;

    for day in &days {
        for &time in &times {
            let key = Scope::new(*day, EmployeeId(2)).slot(time);
            let mut handles = Vec::with_capacity(n_clients);
            for _ in 0..n_clients {
                let backend = backend.clone();
                handles.push(tokio::spawn(async move {
                    backend
                        .select_slot(SelectRequest {
                            slot_key: key,
                            client_id: ClientId::generate(),
                        })
                        .await
                }));
            }
            let mut winners = 0;
            for h in handles {
                match h.await.unwrap() {
                    Ok(()) => winners += 1,
                    Err(BackendError::SlotTaken { .. }) => rejected += 1,
                    Err(e) => panic!("unexpected error: {e}"),
                }
            }
            assert_eq!(winners, 1, "{key} held by {winners} clients");
            won += winners;
        }
    }

    let elapsed = start.elapsed();
    let total = won + rejected;
    println!(
        "  {} slots x {n_clients} clients = {total} selects in {:.2}s, {won} held, {rejected} rejected",
        days.len() * times.len(),
        elapsed.as_secs_f64()
    );
}

async fn phase3_poll_under_load(backend: Arc<LocalBackend>) {
    let scope = Scope::new(open_days(1)[0], EmployeeId(3));
    let times = backend.schedule().slot_times();

    // Writers keep moving their holds around the same day
    let stop = Arc::new(AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for w in 0..5 {
        let backend = backend.clone();
        let stop = stop.clone();
        let times = times.clone();
        writer_handles.push(tokio::spawn(async move {
            let client = ClientId::generate();
            let mut i = w;
            while !stop.load(Ordering::Relaxed) {
                let _ = backend
                    .select_slot(SelectRequest {
                        slot_key: scope.slot(times[i % times.len()]),
                        client_id: client,
                    })
                    .await;
                i += 5;
                tokio::task::yield_now().await;
            }
        }));
    }

    let n_readers = 10;
    let polls_per_reader = 500;
    let mut reader_handles = Vec::new();
    for _ in 0..n_readers {
        let backend = backend.clone();
        reader_handles.push(tokio::spawn(async move {
            let client = ClientId::generate();
            let mut latencies = Vec::with_capacity(polls_per_reader);
            for _ in 0..polls_per_reader {
                let t = Instant::now();
                backend
                    .poll(PollRequest {
                        client_id: Some(client),
                        ..PollRequest::new(scope)
                    })
                    .await
                    .unwrap();
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all_latencies = Vec::new();
    for h in reader_handles {
        all_latencies.extend(h.await.unwrap());
    }

    stop.store(true, Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }

    print_latency("poll latency", &mut all_latencies);
}

async fn phase4_booking_storm(backend: Arc<LocalBackend>) {
    let days = open_days(10);
    let times = backend.schedule().slot_times();
    let n_tasks = 50;

    let start = Instant::now();
    let booked = Arc::new(AtomicUsize::new(0));
    let taken = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();

    for i in 0..n_tasks {
        let backend = backend.clone();
        let (days, times) = (days.clone(), times.clone());
        let (booked, taken) = (booked.clone(), taken.clone());
        handles.push(tokio::spawn(async move {
            // every task walks every slot, so each slot sees n_tasks attempts
            for day in &days {
                for &time in &times {
                    let key = Scope::new(*day, EmployeeId(4)).slot(time);
                    match backend.create_booking(booking(key, i)).await {
                        Ok(_) => booked.fetch_add(1, Ordering::Relaxed),
                        Err(BackendError::SlotTaken { .. }) => taken.fetch_add(1, Ordering::Relaxed),
                        Err(e) => panic!("unexpected error: {e}"),
                    };
                }
            }
        }));
    }

    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let slots = days.len() * times.len();
    let ok = booked.load(Ordering::Relaxed);
    assert_eq!(ok, slots, "every slot booked exactly once");
    println!(
        "  {n_tasks} tasks over {slots} slots: {ok} booked, {} slot_taken in {:.2}s",
        taken.load(Ordering::Relaxed),
        elapsed.as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    println!("=== slotsync stress benchmark ===\n");

    println!("[phase 1] sequential select throughput");
    phase1_select_cycle(&backend()).await;

    println!("\n[phase 2] contended selects, one holder per slot");
    phase2_contended_select(backend()).await;

    println!("\n[phase 3] poll latency under select load");
    phase3_poll_under_load(backend()).await;

    println!("\n[phase 4] booking storm");
    phase4_booking_storm(backend()).await;

    println!("\n=== benchmark complete ===");
}
