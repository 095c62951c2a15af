use conn_core::codec::{Kind, Packer};
use criterion::{criterion_group, criterion_main, Criterion};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BenchKind {
    Control,
    Data,
    Ack,
}

impl Kind for BenchKind {
    const MAX_ORDINAL: u64 = 2;

    fn ordinal(&self) -> u64 {
        match self {
            BenchKind::Control => 0,
            BenchKind::Data => 1,
            BenchKind::Ack => 2,
        }
    }

    fn from_ordinal(ordinal: u64) -> Self {
        match ordinal {
            0 => BenchKind::Control,
            1 => BenchKind::Data,
            2 => BenchKind::Ack,
            other => panic!("unknown bench kind ordinal {}", other),
        }
    }
}

pub fn codec_bench(c: &mut Criterion) {
    let packer: Packer<BenchKind> = Packer::new(512).unwrap();

    let mut group = c.benchmark_group("codec");

    group.bench_function("pack", |b| {
        b.iter(|| packer.pack(BenchKind::Data, 271, 99).unwrap())
    });

    let handle = packer.pack(BenchKind::Data, 271, 99).unwrap();
    group.bench_function("unpack_all", |b| b.iter(|| packer.unpack_all(handle)));
}

criterion_group!(benches, codec_bench);
criterion_main!(benches);
