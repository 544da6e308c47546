//! Pipeline benchmark: raw plugin text → parsed tables → canonical image → feature vectors.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use memfeat::features::FeatureExtractor;
use memfeat::normalize::Normalizer;
use memfeat::parser::registry::{DLLLIST, HANDLES, PSLIST};
use memfeat::parser::{self, ParsedTables};
use memfeat::runner::PluginResult;

const BANNER: &str = "Volatility 3 Framework 2.5.0\n\n";

fn pslist(n: u32) -> String {
    let mut out = format!(
        "{BANNER}PID\tPPID\tImageFileName\tOffset(V)\tThreads\tHandles\tSessionId\tWow64\tCreateTime\tExitTime\tFile output\n\n"
    );
    for pid in 0..n {
        let ppid = if pid == 0 { 0 } else { (pid - 1) / 4 * 4 + 4 };
        out.push_str(&format!(
            "{}\t{}\tproc_{pid}.exe\t0xfa80{pid:08x}\t{}\t{}\t1\tFalse\t2019-12-14 10:{:02}:{:02}.000000 UTC\tN/A\tDisabled\n",
            pid * 4 + 4,
            ppid,
            pid % 32 + 1,
            pid % 500 + 20,
            pid / 60 % 60,
            pid % 60,
        ));
    }
    out
}

fn handles(n: u32, per_process: u32) -> String {
    let types = ["File", "Key", "Event", "Mutant", "Section", "Thread"];
    let mut out = format!("{BANNER}PID\tProcess\tOffset\tHandleValue\tType\tGrantedAccess\tName\n\n");
    for pid in 0..n + 2 {
        for h in 0..per_process {
            out.push_str(&format!(
                "{}\tproc_{pid}.exe\t0x{:x}\t0x{:x}\t{}\t0x1f0001\tobj_{h}\n",
                pid * 4 + 4,
                0xfa8000000000u64 + u64::from(pid * 1000 + h),
                h * 4,
                types[(h as usize) % types.len()],
            ));
        }
    }
    out
}

fn dlllist(n: u32) -> String {
    let mut out = format!("{BANNER}PID\tProcess\tBase\tSize\tName\tPath\tLoadTime\tFile output\n\n");
    for pid in 0..n {
        for (i, dll) in ["ntdll.dll", "kernel32.dll", "user32.dll"].iter().enumerate() {
            out.push_str(&format!(
                "{}\tproc_{pid}.exe\t0x{:x}\t0x10000\t{dll}\tC:\\Windows\\System32\\{dll}\tN/A\tDisabled\n",
                pid * 4 + 4,
                0x7ff0_0000u64 + (i as u64) * 0x10000,
            ));
        }
    }
    out
}

fn results(n: u32) -> Vec<PluginResult> {
    vec![
        PluginResult::from_output(PSLIST, "bench", pslist(n)),
        PluginResult::from_output(HANDLES, "bench", handles(n, 40)),
        PluginResult::from_output(DLLLIST, "bench", dlllist(n)),
    ]
}

fn bench_parse(c: &mut Criterion) {
    let raw = results(200);
    c.bench_function("parse_200_processes", |b| {
        b.iter(|| black_box(raw.iter().map(parser::parse).collect::<Vec<_>>()))
    });
}

fn bench_normalize_and_extract(c: &mut Criterion) {
    let parsed: Vec<_> = results(200).iter().map(parser::parse).collect();
    let tables = ParsedTables::collect(&parsed);
    let normalizer = Normalizer::new([PSLIST, HANDLES, DLLLIST]);
    let extractor = FeatureExtractor::new(memfeat::features::CURRENT_SCHEMA_VERSION).expect("built-in schema");

    c.bench_function("normalize_200_processes", |b| {
        b.iter(|| black_box(normalizer.normalize("bench", black_box(&tables))))
    });

    let image = normalizer.normalize("bench", &tables);
    c.bench_function("extract_200_processes", |b| {
        b.iter(|| {
            let img = black_box(&image);
            black_box((extractor.image(img), extractor.processes(img)))
        })
    });
}

criterion_group!(benches, bench_parse, bench_normalize_and_extract);
criterion_main!(benches);
