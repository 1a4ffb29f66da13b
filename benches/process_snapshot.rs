use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ptybroker::{ProcessInfo, ProcessSnapshot};

/// `sessions` login shells, each with a foreground chain `depth` deep and a few background jobs
fn synthetic_table(sessions: i32, depth: i32) -> Vec<ProcessInfo> {
    let mut processes = vec![ProcessInfo::new(1, 0, "init")];
    let mut next_pid = 2;
    for session in 0..sessions {
        let tty = session as u64 + 1;
        let login = next_pid;
        next_pid += 1;
        processes.push(ProcessInfo::new(login, 1, "login").with_tty(tty));

        let mut parent = login;
        for _ in 0..depth {
            let pid = next_pid;
            next_pid += 1;
            processes.push(ProcessInfo::new(pid, parent, "job").with_tty(tty).in_foreground());
            for _ in 0..3 {
                processes.push(ProcessInfo::new(next_pid, pid, "bg").with_tty(tty));
                next_pid += 1;
            }
            parent = pid;
        }
    }
    processes
}

fn bench_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("snapshot_build");
    for sessions in [10, 100, 1000] {
        let table = synthetic_table(sessions, 4);
        group.bench_with_input(BenchmarkId::from_parameter(sessions), &table, |b, table| {
            b.iter(|| ProcessSnapshot::from_processes(black_box(table.clone()), 1))
        });
    }
    group.finish();
}

fn bench_foreground_walk(c: &mut Criterion) {
    let snapshot = ProcessSnapshot::from_processes(synthetic_table(500, 8), 1);
    c.bench_function("deepest_foreground_job", |b| {
        b.iter(|| snapshot.deepest_foreground_job(black_box(2)).map(|p| p.pid))
    });
    c.bench_function("descendants", |b| b.iter(|| snapshot.descendants(black_box(2)).len()));
}

fn bench_diff(c: &mut Criterion) {
    let before = ProcessSnapshot::from_processes(synthetic_table(500, 4), 1);
    let mut table = synthetic_table(500, 4);
    for info in table.iter_mut().step_by(7) {
        info.foreground = !info.foreground;
    }
    let after = ProcessSnapshot::from_processes(table, 2);
    c.bench_function("changed_pids", |b| b.iter(|| after.changed_pids(black_box(&before)).len()));
}

criterion_group!(benches, bench_build, bench_foreground_walk, bench_diff);
criterion_main!(benches);
