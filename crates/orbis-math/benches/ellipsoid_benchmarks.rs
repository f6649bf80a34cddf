use criterion::{Criterion, black_box, criterion_group, criterion_main};
use glam::DVec3;
use orbis_math::*;

fn bench_hit(c: &mut Criterion) {
    let e = Ellipsoid::WGS84;
    let ray = black_box(Ray::new(
        DVec3::new(12_000_000.0, 3_000_000.0, 2_000_000.0),
        DVec3::new(-1.0, -0.2, -0.15),
    ));
    c.bench_function("ellipsoid_hit", |bencher| bencher.iter(|| black_box(e.hit(&ray))));
}

fn bench_hit_miss(c: &mut Criterion) {
    let e = Ellipsoid::WGS84;
    let ray = black_box(Ray::new(DVec3::new(12_000_000.0, 0.0, 0.0), DVec3::X));
    c.bench_function("ellipsoid_hit_miss", |bencher| {
        bencher.iter(|| black_box(e.hit(&ray)))
    });
}

fn bench_altitude(c: &mut Criterion) {
    let e = Ellipsoid::WGS84;
    let p = black_box(e.geodetic_to_cartesian(37.6, 55.75, 10_000.0));
    c.bench_function("ellipsoid_altitude", |bencher| {
        bencher.iter(|| black_box(e.altitude(p)))
    });
}

fn bench_high_low_split(c: &mut Criterion) {
    let p = black_box(DVec3::new(4_510_023.25, 2_100_000.125, -4_000_000.5));
    c.bench_function("high_low_split", |bencher| {
        bencher.iter(|| black_box(HighLowVec3::split(p)))
    });
}

fn bench_bounding_sphere(c: &mut Criterion) {
    let e = Ellipsoid::WGS84;
    let extent = black_box(Extent::web_mercator_world().quadrant(Quadrant::NorthEast));
    c.bench_function("bounding_sphere_from_extent", |bencher| {
        bencher.iter(|| {
            black_box(BoundingSphere::from_extent(
                &extent,
                TileProjection::WebMercator,
                &e,
                0.0,
            ))
        })
    });
}

criterion_group!(
    benches,
    bench_hit,
    bench_hit_miss,
    bench_altitude,
    bench_high_low_split,
    bench_bounding_sphere,
);
criterion_main!(benches);
