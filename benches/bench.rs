use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use file_jpeg::{
    estimate_quality, read_header, standard_tables, BaseType, Export, ExportConfig, Exporter,
    Image, Importer, Layer, NoProgress, PixelBuffer, PixelFormat, QuantizationTableSet,
};

const WIDTH: u32 = 512;
const HEIGHT: u32 = 384;

fn test_image() -> (Image, Layer) {
    let mut data = Vec::with_capacity((WIDTH * HEIGHT * 3) as usize);
    for _ in 0..WIDTH * HEIGHT * 3 {
        data.push(fastrand::u8(..));
    }
    let buffer = PixelBuffer::from_data(WIDTH, HEIGHT, PixelFormat::Rgb, data).unwrap();
    (
        Image::new(WIDTH, HEIGHT, BaseType::Rgb),
        Layer::new("Background", buffer),
    )
}

fn quality(c: &mut Criterion) {
    let mut sets = Vec::new();
    for q in 1..=100 {
        let (luma, chroma) = standard_tables(q, true);
        let mut set = QuantizationTableSet::new();
        set.set(0, luma);
        set.set(1, chroma);
        sets.push(set);
    }

    c.bench_function("estimate_quality", |b| {
        b.iter(|| {
            for set in &sets {
                black_box(estimate_quality(black_box(set), 3));
            }
        })
    });
}

fn codec(c: &mut Criterion) {
    fastrand::seed(7);
    let (image, layer) = test_image();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bench.jpg");
    let exporter = Exporter::new();
    let config = ExportConfig::default();

    let mut group = c.benchmark_group("codec");
    group.throughput(Throughput::Bytes((WIDTH * HEIGHT * 3) as u64));
    group.sample_size(20);
    group.bench_function("export", |b| {
        b.iter(|| {
            let export = exporter
                .export(&path, &config, &image, &[&layer], &image, false, &mut NoProgress)
                .unwrap();
            assert!(matches!(export, Export::Done));
        })
    });

    let data = std::fs::read(&path).unwrap();
    group.bench_function("read_header", |b| {
        b.iter(|| read_header(black_box(&data)).unwrap())
    });
    let importer = Importer::new();
    group.bench_function("import", |b| {
        b.iter(|| importer.import_bytes(black_box(&data), false).unwrap())
    });
    group.finish();
}

criterion_group!(benches, quality, codec);
criterion_main!(benches);
