#![forbid(unsafe_code)]

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use macadam::{CostFunction, Dijkstra, EdgeView, PathTrace, RouterDb, SnapPoint, DEFAULT_ZOOM};

/// Grid side lengths exercised by the routing benchmarks.
const GRID_SIDES: [usize; 3] = [8, 16, 32];

/// Spacing between grid vertices, in degrees (roughly 110m).
const SPACING: f64 = 0.001;

struct DistanceCost;

impl CostFunction for DistanceCost {
    fn cost(&mut self, edge: &EdgeView, _previous: PathTrace<'_>) -> (f64, f64) {
        (edge.length_cm().map(f64::from).unwrap_or(0.0), 0.0)
    }
}

struct GridHarness {
    db: RouterDb,
    source: SnapPoint,
    target: SnapPoint,
}

impl GridHarness {
    fn new(side: usize) -> Self {
        let db = RouterDb::new(DEFAULT_ZOOM).expect("db");
        {
            let mut writer = db.get_writer().expect("writer");
            let mut vertices = Vec::with_capacity(side * side);
            for row in 0..side {
                for column in 0..side {
                    vertices.push(
                        writer.add_vertex(column as f64 * SPACING, row as f64 * SPACING),
                    );
                }
            }
            for row in 0..side {
                for column in 0..side {
                    let here = vertices[row * side + column];
                    if column + 1 < side {
                        writer
                            .add_edge(here, vertices[row * side + column + 1], &[], None, None)
                            .expect("horizontal edge");
                    }
                    if row + 1 < side {
                        writer
                            .add_edge(here, vertices[(row + 1) * side + column], &[], None, None)
                            .expect("vertical edge");
                    }
                }
            }
        }
        let network = db.latest();
        let max = (side - 1) as f64 * SPACING;
        let source = network.snap(SPACING / 2.0, 0.0, 100.0).expect("source snap");
        let target = network
            .snap(max - SPACING / 2.0, max, 100.0)
            .expect("target snap");
        Self { db, source, target }
    }
}

fn grid_routing(c: &mut Criterion) {
    let mut group = c.benchmark_group("dijkstra/grid");
    group.sample_size(40);
    group.throughput(Throughput::Elements(1));

    for side in GRID_SIDES {
        let harness = GridHarness::new(side);
        let network = harness.db.latest();
        let mut dijkstra = Dijkstra::new();
        group.bench_with_input(
            BenchmarkId::new("corner_to_corner", side),
            &side,
            |b, _| {
                b.iter(|| {
                    black_box(dijkstra.run_one(
                        &network,
                        harness.source,
                        harness.target,
                        &mut DistanceCost,
                    ))
                });
            },
        );
    }
    group.finish();
}

fn grid_snapping(c: &mut Criterion) {
    let mut group = c.benchmark_group("dijkstra/snap");
    group.sample_size(40);

    let harness = GridHarness::new(16);
    let network = harness.db.latest();
    group.bench_function("snap_mid_grid", |b| {
        b.iter(|| black_box(network.snap(0.0075, 0.0075, 120.0)));
    });
    group.finish();
}

criterion_group!(benches, grid_routing, grid_snapping);
criterion_main!(benches);
