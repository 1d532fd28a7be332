use criterion::criterion_group;
use criterion::criterion_main;
use criterion::BenchmarkId;
use criterion::Criterion;

use amber::addresses::AddressInfo;
use amber::addresses::NodeAddress;
use amber::execution::WorkflowExecution;
use amber::identity::ActorVirtualIdentity;
use amber::identity::OperatorIdentity;
use amber::identity::RegionIdentity;
use amber::placement::resolve_location;
use amber::placement::LocationPreference;
use amber::worker::profile::TableProfileManager;
use amber::worker::Tuple;

fn model_with(operators: usize, workers: usize) -> WorkflowExecution {
    let mut model = WorkflowExecution::new();
    model.init_region_execution(RegionIdentity(1)).unwrap();
    for op_index in 0..operators {
        let op = OperatorIdentity::new(format!("op{op_index}"));
        model.init_operator_execution(RegionIdentity(1), op.clone()).unwrap();
        for index in 0..workers {
            model
                .register_worker(RegionIdentity(1), &op, ActorVirtualIdentity::worker(&op, index))
                .unwrap();
        }
    }
    model
}

pub fn criterion_benchmark(c: &mut Criterion) {
    let addresses = AddressInfo::new(
        NodeAddress::new("n0", 2552),
        (0..16).map(|i| NodeAddress::new(format!("n{i}"), 2552)),
    );
    c.bench_function("round_robin_1000_workers", |b| {
        b.iter(|| {
            for index in 0..1000 {
                resolve_location(index, &LocationPreference::RoundRobin, &addresses).unwrap();
            }
        })
    });

    let mut group = c.benchmark_group("region_stats");
    for workers in [4, 64] {
        let model = model_with(8, workers);
        group.bench_with_input(BenchmarkId::from_parameter(workers), &model, |b, model| {
            b.iter(|| model.get_all_region_executions_stats())
        });
    }
    group.finish();

    let tuples: Vec<Tuple> = (0..1000)
        .map(|i| {
            let mut tuple = Tuple::new();
            tuple.insert("id", i.into());
            tuple.insert("bucket", (i % 7).into());
            tuple.insert("name", format!("row-{}", i % 100).into());
            tuple
        })
        .collect();
    c.bench_function("table_profile_1000_tuples", |b| {
        b.iter(|| {
            let mut profile = TableProfileManager::new();
            for tuple in &tuples {
                profile.update(tuple);
            }
            profile.table_profile()
        })
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
