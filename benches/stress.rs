use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Days;
use ulid::Ulid;

use reserva::engine::{AvailabilityQuery, BookingRequest, Engine, EngineError};
use reserva::model::*;
use reserva::notify::NotifyHub;

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

fn bench_engine(name: &str) -> Arc<Engine> {
    let dir = std::env::temp_dir().join("reserva_bench");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(format!("{name}_{}.wal", Ulid::new()));
    Arc::new(Engine::new(path, Arc::new(NotifyHub::new())).unwrap())
}

fn wide_open_service(capacity: u32) -> Service {
    Service {
        id: Ulid::new(),
        name: None,
        duration_min: 15,
        open_min: 0,
        close_min: 1440,
        min_advance_hours: 0,
        max_advance_days: 90,
        requires_consultation: false,
        consultation_duration_min: None,
        package_id: None,
        default_capacity: capacity,
    }
}

fn request(service_id: Ulid, scheduled_at: Ms) -> BookingRequest {
    BookingRequest {
        target: BookingTarget::Service { id: service_id },
        location_id: None,
        client: ClientContact { name: "bench".into(), email: None, phone: None },
        scheduled_at,
        notes: None,
    }
}

/// `i`-th slot of a schedule that spreads 50 bookings per day starting
/// tomorrow, on the 15-minute grid.
fn spread_slot(i: usize) -> Ms {
    let day = day_of(now()) + Days::new(1 + (i / 50) as u64);
    day_start_ms(day) + (i % 50) as Ms * 15 * MINUTE_MS
}

fn now() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as Ms
}

async fn phase1_sequential_bookings(engine: &Arc<Engine>) {
    let svc = wide_open_service(50);
    engine.register_service(svc.clone()).await.unwrap();

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let t = Instant::now();
        engine.create_booking(request(svc.id, spread_slot(i))).await.unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    println!(
        "  throughput: {:.0} bookings/s",
        n as f64 / elapsed.as_secs_f64()
    );
    print_latency("sequential create_booking", &mut latencies);
}

async fn phase2_parallel_services(engine: &Arc<Engine>) {
    let tasks = 8;
    let per_task = 250;

    let start = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..tasks {
        let eng = engine.clone();
        handles.push(tokio::spawn(async move {
            let svc = wide_open_service(50);
            eng.register_service(svc.clone()).await.unwrap();
            let mut latencies = Vec::with_capacity(per_task);
            for i in 0..per_task {
                let t = Instant::now();
                eng.create_booking(request(svc.id, spread_slot(i))).await.unwrap();
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all = Vec::new();
    for h in handles {
        all.extend(h.await.unwrap());
    }
    let elapsed = start.elapsed();
    println!(
        "  throughput: {:.0} bookings/s across {tasks} tasks",
        (tasks * per_task) as f64 / elapsed.as_secs_f64()
    );
    print_latency("parallel create_booking", &mut all);
}

async fn phase3_contended_cell(engine: &Arc<Engine>) {
    let svc = wide_open_service(50);
    engine.register_service(svc.clone()).await.unwrap();
    let day = day_of(now()) + Days::new(1);

    // 100 tasks fight over a 50-unit day cell.
    let mut handles = Vec::new();
    for i in 0..100 {
        let eng = engine.clone();
        let sid = svc.id;
        let ts = day_start_ms(day) + (i % 96) as Ms * 15 * MINUTE_MS;
        handles.push(tokio::spawn(async move {
            let t = Instant::now();
            let result = eng.create_booking(request(sid, ts)).await;
            (t.elapsed(), result)
        }));
    }

    let mut latencies = Vec::new();
    let mut admitted = 0usize;
    let mut refused = 0usize;
    for h in handles {
        let (lat, result) = h.await.unwrap();
        latencies.push(lat);
        match result {
            Ok(_) => admitted += 1,
            Err(EngineError::CapacityExhausted { .. }) => refused += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(admitted, 50, "cell must admit exactly its capacity");
    println!("  admitted={admitted}, refused={refused}");
    print_latency("contended create_booking", &mut latencies);
}

async fn phase4_availability_scans(engine: &Arc<Engine>) {
    let svc = wide_open_service(10);
    engine.register_service(svc.clone()).await.unwrap();
    for i in 0..200 {
        engine.create_booking(request(svc.id, spread_slot(i * 5))).await.unwrap();
    }

    let n = 500;
    let mut latencies = Vec::with_capacity(n);
    let query = AvailabilityQuery {
        target: BookingTarget::Service { id: svc.id },
        location_id: None,
        from: day_of(now()) + Days::new(1),
        days_ahead: Some(90),
        duration_override: None,
    };
    for _ in 0..n {
        let t = Instant::now();
        let slots = engine.open_slots(&query).await.unwrap();
        assert!(!slots.is_empty());
        latencies.push(t.elapsed());
    }
    print_latency("open_slots over 90 days", &mut latencies);
}

#[tokio::main]
async fn main() {
    println!("phase 1: sequential bookings, one service");
    phase1_sequential_bookings(&bench_engine("phase1")).await;

    println!("phase 2: parallel bookings, independent services");
    phase2_parallel_services(&bench_engine("phase2")).await;

    println!("phase 3: contended day cell");
    phase3_contended_cell(&bench_engine("phase3")).await;

    println!("phase 4: availability scans under load");
    phase4_availability_scans(&bench_engine("phase4")).await;
}
