use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use raya_adjustor::{
    emit, Adjustors, CallingConvention, ConventionTable, FrameLayout, Handle, PageAllocator,
    StableHandleTable, StubParams, Target, TargetArch, TargetOs,
};

fn i386_table() -> ConventionTable {
    ConventionTable::for_target(Target::new(TargetArch::X86, TargetOs::Linux))
        .with_ccall_entry(0x0804_2000)
}

fn bench_emit(c: &mut Criterion) {
    let mut group = c.benchmark_group("emit");
    let handle = Handle::from_raw(1).unwrap();

    for conv in CallingConvention::ALL {
        group.bench_with_input(BenchmarkId::new("stub", conv), &conv, |b, &conv| {
            let params = StubParams {
                base: 0x0800_0000,
                handle,
                adapter: 0x0040_1000,
                ccall_entry: Some(0x0804_2000),
                frame: Some(FrameLayout::for_slots(4)),
            };
            b.iter(|| emit(black_box(conv), black_box(&params)).unwrap());
        });
    }
    group.finish();
}

fn bench_build_and_reap(c: &mut Criterion) {
    let adjustors = Adjustors::new(i386_table(), PageAllocator::new(), StableHandleTable::new());

    c.bench_function("build_reap_ccall", |b| {
        b.iter(|| {
            let handle = adjustors.handles().acquire(42u32).unwrap();
            let addr = adjustors
                .create(CallingConvention::CCall, handle, 0x0040_1000, Some(&3usize))
                .unwrap();
            adjustors.free(black_box(addr)).unwrap()
        });
    });
}

criterion_group!(benches, bench_emit, bench_build_and_reap);
criterion_main!(benches);
