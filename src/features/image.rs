//! Image-scope feature declarations.

use super::schema::ImageFeature;
use super::safe_div;
use crate::normalize::{
    AnomalyFlag, CanonicalImage, CanonicalProcess, HandleRef, LdrModuleRef, RegionRef, ServiceRef, Visibility,
};
use crate::parser::registry::{
    CALLBACKS, DLLLIST, HANDLES, LDRMODULES, MALFIND, MODULES, PSLIST, PSSCAN, PSXVIEW, SVCSCAN,
};
use crate::parser::ArtifactKind;
use std::collections::BTreeSet;

fn listed(img: &CanonicalImage) -> impl Iterator<Item = &CanonicalProcess> {
    img.processes.values().filter(|p| p.sources.contains(PSLIST))
}

fn nproc(img: &CanonicalImage) -> f64 {
    listed(img).count() as f64
}

fn handles(img: &CanonicalImage) -> impl Iterator<Item = &HandleRef> {
    img.processes
        .values()
        .flat_map(|p| p.open_handles.iter())
        .chain(img.unresolved.handles.iter())
}

fn handles_of_type(img: &CanonicalImage, t: &str) -> f64 {
    handles(img).filter(|h| h.is_type(t)).count() as f64
}

fn ldr_modules(img: &CanonicalImage) -> impl Iterator<Item = &LdrModuleRef> {
    img.processes
        .values()
        .flat_map(|p| p.ldr_modules.iter())
        .chain(img.unresolved.ldr_modules.iter())
}

fn regions(img: &CanonicalImage) -> impl Iterator<Item = &RegionRef> {
    img.processes
        .values()
        .flat_map(|p| p.memory_regions.iter())
        .chain(img.unresolved.regions.iter())
}

fn services(img: &CanonicalImage) -> impl Iterator<Item = &ServiceRef> {
    img.processes
        .values()
        .flat_map(|p| p.services.iter())
        .chain(img.services.iter())
        .chain(img.unresolved.services.iter())
}

fn count_services(img: &CanonicalImage, pred: fn(&ServiceRef) -> bool) -> f64 {
    services(img).filter(|s| pred(s)).count() as f64
}

fn not_in_load(img: &CanonicalImage) -> f64 {
    ldr_modules(img).filter(|m| m.in_load == Some(false)).count() as f64
}

fn not_in_init(img: &CanonicalImage) -> f64 {
    ldr_modules(img).filter(|m| m.in_init == Some(false)).count() as f64
}

fn not_in_mem(img: &CanonicalImage) -> f64 {
    ldr_modules(img).filter(|m| m.in_mem == Some(false)).count() as f64
}

/// Processes whose psxview row reports them missing from `view`.
fn not_in_view(img: &CanonicalImage, view: fn(&Visibility) -> Option<bool>) -> f64 {
    img.processes
        .values()
        .filter_map(|p| p.visibility.as_ref())
        .chain(img.unresolved.visibility.iter())
        .filter(|v| view(v) == Some(false))
        .count() as f64
}

/// Processes owning at least one artifact, or every process when none does.
fn owners_or_nproc(img: &CanonicalImage, owns: fn(&CanonicalProcess) -> bool) -> f64 {
    let owners = img.processes.values().filter(|p| owns(p)).count();
    if owners > 0 {
        owners as f64
    } else {
        img.processes.len() as f64
    }
}

fn flagged(img: &CanonicalImage, flag: AnomalyFlag) -> f64 {
    img.processes.values().filter(|p| p.has_flag(flag)).count() as f64
}

pub(super) static V1: &[ImageFeature] = &[
    ImageFeature { name: "pslist.nproc", requires: &[PSLIST], eval: nproc },
    ImageFeature {
        name: "pslist.nppid",
        requires: &[PSLIST],
        eval: |img| listed(img).filter_map(|p| p.ppid).collect::<BTreeSet<_>>().len() as f64,
    },
    ImageFeature {
        name: "pslist.avg_threads",
        requires: &[PSLIST],
        eval: |img| safe_div(listed(img).filter_map(|p| p.threads).sum::<u64>() as f64, nproc(img)),
    },
    ImageFeature {
        name: "pslist.avg_handlers",
        requires: &[PSLIST],
        eval: |img| safe_div(listed(img).filter_map(|p| p.handle_count).sum::<u64>() as f64, nproc(img)),
    },
    ImageFeature {
        name: "pslist.nprocs64bit",
        requires: &[PSLIST],
        eval: |img| match img.os_profile.as_ref().and_then(|os| os.is_64bit) {
            Some(true) => listed(img).filter(|p| p.wow64 == Some(false)).count() as f64,
            _ => 0.0,
        },
    },
    ImageFeature {
        name: "dlllist.ndlls",
        requires: &[DLLLIST],
        eval: |img| img.count(ArtifactKind::Modules).total as f64,
    },
    ImageFeature {
        name: "dlllist.avg_dlls_per_proc",
        requires: &[DLLLIST],
        eval: |img| {
            safe_div(
                img.count(ArtifactKind::Modules).total as f64,
                owners_or_nproc(img, |p| !p.loaded_modules.is_empty()),
            )
        },
    },
    ImageFeature {
        name: "handles.nhandles",
        requires: &[HANDLES],
        eval: |img| img.count(ArtifactKind::Handles).total as f64,
    },
    ImageFeature {
        name: "handles.avg_handles_per_proc",
        requires: &[HANDLES],
        eval: |img| {
            safe_div(
                img.count(ArtifactKind::Handles).total as f64,
                owners_or_nproc(img, |p| !p.open_handles.is_empty()),
            )
        },
    },
    ImageFeature { name: "handles.nport", requires: &[HANDLES], eval: |img| handles_of_type(img, "Port") },
    ImageFeature { name: "handles.nfile", requires: &[HANDLES], eval: |img| handles_of_type(img, "File") },
    ImageFeature { name: "handles.nevent", requires: &[HANDLES], eval: |img| handles_of_type(img, "Event") },
    ImageFeature { name: "handles.ndesktop", requires: &[HANDLES], eval: |img| handles_of_type(img, "Desktop") },
    ImageFeature { name: "handles.nkey", requires: &[HANDLES], eval: |img| handles_of_type(img, "Key") },
    ImageFeature { name: "handles.nthread", requires: &[HANDLES], eval: |img| handles_of_type(img, "Thread") },
    ImageFeature {
        name: "handles.ndirectory",
        requires: &[HANDLES],
        eval: |img| handles_of_type(img, "Directory"),
    },
    ImageFeature {
        name: "handles.nsemaphore",
        requires: &[HANDLES],
        eval: |img| handles_of_type(img, "Semaphore"),
    },
    ImageFeature { name: "handles.ntimer", requires: &[HANDLES], eval: |img| handles_of_type(img, "Timer") },
    ImageFeature { name: "handles.nsection", requires: &[HANDLES], eval: |img| handles_of_type(img, "Section") },
    ImageFeature { name: "handles.nmutant", requires: &[HANDLES], eval: |img| handles_of_type(img, "Mutant") },
    ImageFeature { name: "ldrmodules.not_in_load", requires: &[LDRMODULES], eval: not_in_load },
    ImageFeature { name: "ldrmodules.not_in_init", requires: &[LDRMODULES], eval: not_in_init },
    ImageFeature { name: "ldrmodules.not_in_mem", requires: &[LDRMODULES], eval: not_in_mem },
    ImageFeature {
        name: "ldrmodules.not_in_load_avg",
        requires: &[LDRMODULES, PSLIST],
        eval: |img| safe_div(not_in_load(img), nproc(img)),
    },
    ImageFeature {
        name: "ldrmodules.not_in_init_avg",
        requires: &[LDRMODULES, PSLIST],
        eval: |img| safe_div(not_in_init(img), nproc(img)),
    },
    ImageFeature {
        name: "ldrmodules.not_in_mem_avg",
        requires: &[LDRMODULES, PSLIST],
        eval: |img| safe_div(not_in_mem(img), nproc(img)),
    },
    ImageFeature {
        name: "malfind.ninjections",
        requires: &[MALFIND],
        eval: |img| img.count(ArtifactKind::Regions).total as f64,
    },
    ImageFeature {
        name: "malfind.commitCharge",
        requires: &[MALFIND],
        eval: |img| regions(img).filter_map(|r| r.commit_charge).sum::<u64>() as f64,
    },
    ImageFeature {
        name: "malfind.rwx_regions",
        requires: &[MALFIND],
        eval: |img| regions(img).filter(|r| r.is_executable_writable()).count() as f64,
    },
    ImageFeature {
        name: "malfind.uniqueInjections",
        requires: &[MALFIND],
        eval: |img| regions(img).map(|r| (r.pid, r.start)).collect::<BTreeSet<_>>().len() as f64,
    },
    ImageFeature {
        name: "psxview.not_in_pslist",
        requires: &[PSXVIEW],
        eval: |img| not_in_view(img, |v| v.pslist),
    },
    ImageFeature {
        name: "psxview.not_in_psscan",
        requires: &[PSXVIEW],
        eval: |img| not_in_view(img, |v| v.psscan),
    },
    ImageFeature {
        name: "psxview.not_in_thrdscan",
        requires: &[PSXVIEW],
        eval: |img| not_in_view(img, |v| v.thrdscan),
    },
    ImageFeature {
        name: "psxview.not_in_csrss",
        requires: &[PSXVIEW],
        eval: |img| not_in_view(img, |v| v.csrss),
    },
    ImageFeature {
        name: "psxview.not_in_pslist_false_avg",
        requires: &[PSXVIEW, PSLIST],
        eval: |img| safe_div(not_in_view(img, |v| v.pslist), nproc(img)),
    },
    ImageFeature {
        name: "psxview.not_in_psscan_false_avg",
        requires: &[PSXVIEW, PSLIST],
        eval: |img| safe_div(not_in_view(img, |v| v.psscan), nproc(img)),
    },
    ImageFeature {
        name: "psxview.not_in_thrdscan_false_avg",
        requires: &[PSXVIEW, PSLIST],
        eval: |img| safe_div(not_in_view(img, |v| v.thrdscan), nproc(img)),
    },
    ImageFeature {
        name: "psxview.not_in_csrss_false_avg",
        requires: &[PSXVIEW, PSLIST],
        eval: |img| safe_div(not_in_view(img, |v| v.csrss), nproc(img)),
    },
    ImageFeature {
        name: "modules.nmodules",
        requires: &[MODULES],
        eval: |img| img.kernel_modules.len() as f64,
    },
    ImageFeature {
        name: "svcscan.nservices",
        requires: &[SVCSCAN],
        eval: |img| services(img).count() as f64,
    },
    ImageFeature {
        name: "svcscan.kernel_drivers",
        requires: &[SVCSCAN],
        eval: |img| count_services(img, ServiceRef::is_kernel_driver),
    },
    ImageFeature {
        name: "svcscan.fs_drivers",
        requires: &[SVCSCAN],
        eval: |img| count_services(img, ServiceRef::is_fs_driver),
    },
    ImageFeature {
        name: "svcscan.process_services",
        requires: &[SVCSCAN],
        eval: |img| count_services(img, ServiceRef::is_own_process),
    },
    ImageFeature {
        name: "svcscan.shared_process_services",
        requires: &[SVCSCAN],
        eval: |img| count_services(img, ServiceRef::is_shared_process),
    },
    ImageFeature {
        name: "svcscan.interactive_process_services",
        requires: &[SVCSCAN],
        eval: |img| count_services(img, ServiceRef::is_interactive),
    },
    ImageFeature {
        name: "svcscan.nactive",
        requires: &[SVCSCAN],
        eval: |img| count_services(img, ServiceRef::is_running),
    },
    ImageFeature {
        name: "callbacks.ncallbacks",
        requires: &[CALLBACKS],
        eval: |img| img.callbacks.len() as f64,
    },
    ImageFeature {
        name: "callbacks.nanonymous",
        requires: &[CALLBACKS],
        eval: |img| img.callbacks.iter().filter(|c| c.symbol.is_none()).count() as f64,
    },
    ImageFeature {
        name: "callbacks.ngeneric",
        requires: &[CALLBACKS],
        eval: |img| {
            img.callbacks
                .iter()
                .filter(|c| {
                    c.module
                        .as_deref()
                        .map_or(false, |m| m.eq_ignore_ascii_case("generic") || m.eq_ignore_ascii_case("unknown"))
                })
                .count() as f64
        },
    },
];

/// Cross-plugin features that only exist once artifacts are joined into a graph.
pub(super) static GRAPH: &[ImageFeature] = &[
    ImageFeature {
        name: "graph.no_parent_processes",
        requires: &[PSLIST],
        eval: |img| flagged(img, AnomalyFlag::NoResolvableParent),
    },
    ImageFeature {
        name: "graph.hidden_processes",
        requires: &[PSLIST, PSSCAN],
        eval: |img| flagged(img, AnomalyFlag::HiddenFromProcessList),
    },
    ImageFeature {
        name: "graph.unresolved_modules",
        requires: &[DLLLIST],
        eval: |img| img.count(ArtifactKind::Modules).orphaned as f64,
    },
    ImageFeature {
        name: "graph.unresolved_handles",
        requires: &[HANDLES],
        eval: |img| img.count(ArtifactKind::Handles).orphaned as f64,
    },
    ImageFeature {
        name: "graph.unresolved_regions",
        requires: &[MALFIND],
        eval: |img| img.count(ArtifactKind::Regions).orphaned as f64,
    },
    ImageFeature {
        name: "graph.unbacked_exec_regions",
        requires: &[MALFIND, DLLLIST],
        eval: |img| {
            img.processes
                .values()
                .map(CanonicalProcess::unbacked_executable_regions)
                .sum::<usize>() as f64
        },
    },
    ImageFeature {
        name: "graph.injected_processes",
        requires: &[MALFIND],
        eval: |img| img.processes.values().filter(|p| !p.memory_regions.is_empty()).count() as f64,
    },
    ImageFeature {
        name: "graph.unlinked_module_processes",
        requires: &[LDRMODULES],
        eval: |img| flagged(img, AnomalyFlag::UnlinkedModule),
    },
    ImageFeature {
        name: "graph.ambiguous_identities",
        requires: &[],
        eval: |img| flagged(img, AnomalyFlag::AmbiguousIdentity),
    },
    ImageFeature {
        name: "graph.exited_processes",
        requires: &[],
        eval: |img| flagged(img, AnomalyFlag::Exited),
    },
    ImageFeature {
        name: "graph.orphan_ratio",
        requires: &[],
        eval: |img| {
            let (orphaned, total) = img
                .image_level_counts
                .values()
                .fold((0, 0), |(o, t), c| (o + c.orphaned, t + c.total));
            safe_div(orphaned as f64, total as f64)
        },
    },
    ImageFeature {
        name: "graph.missing_plugins",
        requires: &[],
        eval: |img| img.plugins.keys().filter(|p| !img.has_plugin(p)).count() as f64,
    },
    ImageFeature {
        name: "graph.warning_count",
        requires: &[],
        eval: |img| img.extraction_warnings.len() as f64,
    },
];
