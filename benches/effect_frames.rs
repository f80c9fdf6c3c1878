//! Per-image frame generation and post-processing at 720p.
//! Run: cargo bench

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use image::{Rgb, RgbImage};

use property_reel::effects::generate_for_image;
use property_reel::grading::apply_grade;
use property_reel::schema::{ColorGrade, Transition};
use property_reel::stabilize::{stabilize_sequence, StabilizerConfig};

fn source_720p() -> RgbImage {
    RgbImage::from_fn(1280, 720, |x, y| {
        let checker = ((x / 40 + y / 40) % 2) as u8 * 60;
        Rgb([(x % 256) as u8 / 2 + checker, (y % 256) as u8 / 2 + checker, 90])
    })
}

fn bench_effects(c: &mut Criterion) {
    let image = source_720p();
    let mut group = c.benchmark_group("effect_frames");
    group.sample_size(10);

    for (label, transition) in [
        ("zoom_720p_30", Transition::Zoom),
        ("pan_720p_30", Transition::Pan),
        ("combined_720p_30", Transition::Combined),
    ] {
        group.bench_function(label, |b| {
            b.iter(|| black_box(generate_for_image(&image, transition, 0, 30)));
        });
    }

    let frame = generate_for_image(&image, Transition::Zoom, 0, 1).remove(0);
    group.bench_function("cinematic_grade_720p_frame", |b| {
        b.iter(|| black_box(apply_grade(&frame, ColorGrade::Cinematic, 0)));
    });

    let sequence = generate_for_image(&image, Transition::Pan, 0, 40);
    let config = StabilizerConfig::with_window(10);
    group.bench_function("stabilize_720p_40_frames", |b| {
        b.iter(|| black_box(stabilize_sequence(sequence.clone(), &config)));
    });

    group.finish();
}

criterion_group!(benches, bench_effects);
criterion_main!(benches);
