//! Process-scope feature declarations.

use super::schema::ProcessFeature;
use super::SENTINEL;
use crate::normalize::{AnomalyFlag, CanonicalImage, CanonicalProcess, ServiceRef, Visibility};
use crate::parser::registry::{DLLLIST, HANDLES, LDRMODULES, MALFIND, PSLIST, PSSCAN, PSXVIEW, SVCSCAN};

fn opt(v: Option<u64>) -> f64 {
    v.map_or(SENTINEL, |n| n as f64)
}

fn bit(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

fn handles_of_type(p: &CanonicalProcess, t: &str) -> f64 {
    p.open_handles.iter().filter(|h| h.is_type(t)).count() as f64
}

fn hidden_in(p: &CanonicalProcess, view: fn(&Visibility) -> Option<bool>) -> f64 {
    bit(p.visibility.as_ref().map_or(false, |v| view(v) == Some(false)))
}

fn any_service(p: &CanonicalProcess, pred: fn(&ServiceRef) -> bool) -> f64 {
    bit(p.services.iter().any(pred))
}

pub(super) static V1: &[ProcessFeature] = &[
    ProcessFeature { name: "threads", requires: &[], eval: |p, _| opt(p.threads) },
    ProcessFeature { name: "handles_pslist", requires: &[], eval: |p, _| opt(p.handle_count) },
    ProcessFeature {
        name: "session_id",
        requires: &[],
        eval: |p, _| opt(p.session_id.map(u64::from)),
    },
    ProcessFeature {
        name: "dll_count",
        requires: &[DLLLIST],
        eval: |p, _| p.loaded_modules.len() as f64,
    },
    ProcessFeature {
        name: "handle_count",
        requires: &[HANDLES],
        eval: |p, _| p.open_handles.len() as f64,
    },
    ProcessFeature {
        name: "file_handle_count",
        requires: &[HANDLES],
        eval: |p, _| handles_of_type(p, "File"),
    },
    ProcessFeature {
        name: "thread_handle_count",
        requires: &[HANDLES],
        eval: |p, _| handles_of_type(p, "Thread"),
    },
    ProcessFeature {
        name: "key_handle_count",
        requires: &[HANDLES],
        eval: |p, _| handles_of_type(p, "Key"),
    },
    ProcessFeature {
        name: "mutant_handle_count",
        requires: &[HANDLES],
        eval: |p, _| handles_of_type(p, "Mutant"),
    },
    ProcessFeature {
        name: "malfind_regions",
        requires: &[MALFIND],
        eval: |p, _| p.memory_regions.len() as f64,
    },
    ProcessFeature {
        name: "malfind_commit_sum",
        requires: &[MALFIND],
        eval: |p, _| p.memory_regions.iter().filter_map(|r| r.commit_charge).sum::<u64>() as f64,
    },
    ProcessFeature {
        name: "malfind_rwx_regions",
        requires: &[MALFIND],
        eval: |p, _| p.memory_regions.iter().filter(|r| r.is_executable_writable()).count() as f64,
    },
    ProcessFeature {
        name: "psxview_hidden_sources",
        requires: &[PSXVIEW],
        eval: |p, _| p.visibility.as_ref().map_or(0, Visibility::hidden_sources) as f64,
    },
    ProcessFeature {
        name: "hidden_in_pslist",
        requires: &[PSXVIEW],
        eval: |p, _| hidden_in(p, |v| v.pslist),
    },
    ProcessFeature {
        name: "hidden_in_psscan",
        requires: &[PSXVIEW],
        eval: |p, _| hidden_in(p, |v| v.psscan),
    },
    ProcessFeature {
        name: "hidden_in_thrdscan",
        requires: &[PSXVIEW],
        eval: |p, _| hidden_in(p, |v| v.thrdscan),
    },
    ProcessFeature {
        name: "hidden_in_csrss",
        requires: &[PSXVIEW],
        eval: |p, _| hidden_in(p, |v| v.csrss),
    },
    ProcessFeature {
        name: "ldr_not_in_load",
        requires: &[LDRMODULES],
        eval: |p, _| p.ldr_modules.iter().filter(|m| m.in_load == Some(false)).count() as f64,
    },
    ProcessFeature {
        name: "ldr_not_in_init",
        requires: &[LDRMODULES],
        eval: |p, _| p.ldr_modules.iter().filter(|m| m.in_init == Some(false)).count() as f64,
    },
    ProcessFeature {
        name: "ldr_not_in_mem",
        requires: &[LDRMODULES],
        eval: |p, _| p.ldr_modules.iter().filter(|m| m.in_mem == Some(false)).count() as f64,
    },
    ProcessFeature {
        name: "svc_is_kernel_driver",
        requires: &[SVCSCAN],
        eval: |p, _| any_service(p, |s| s.is_kernel_driver()),
    },
    ProcessFeature {
        name: "svc_is_fs_driver",
        requires: &[SVCSCAN],
        eval: |p, _| any_service(p, |s| s.is_fs_driver()),
    },
    ProcessFeature {
        name: "svc_is_own_process",
        requires: &[SVCSCAN],
        eval: |p, _| any_service(p, |s| s.is_own_process()),
    },
    ProcessFeature {
        name: "svc_is_shared_process",
        requires: &[SVCSCAN],
        eval: |p, _| any_service(p, |s| s.is_shared_process()),
    },
    ProcessFeature {
        name: "svc_is_running",
        requires: &[SVCSCAN],
        eval: |p, _| any_service(p, |s| s.is_running()),
    },
];

pub(super) static GRAPH: &[ProcessFeature] = &[
    ProcessFeature {
        name: "parent_resolvable",
        requires: &[],
        eval: |p, _| bit(!p.has_flag(AnomalyFlag::NoResolvableParent)),
    },
    ProcessFeature {
        name: "hidden_from_process_list",
        requires: &[PSLIST, PSSCAN],
        eval: |p, _| bit(p.has_flag(AnomalyFlag::HiddenFromProcessList)),
    },
    ProcessFeature {
        name: "unbacked_exec_regions",
        requires: &[MALFIND, DLLLIST],
        eval: |p, _| p.unbacked_executable_regions() as f64,
    },
    ProcessFeature {
        name: "unlinked_module",
        requires: &[LDRMODULES],
        eval: |p, _| bit(p.has_flag(AnomalyFlag::UnlinkedModule)),
    },
    ProcessFeature {
        name: "exited",
        requires: &[],
        eval: |p, _| bit(p.has_flag(AnomalyFlag::Exited)),
    },
    ProcessFeature {
        name: "ambiguous_identity",
        requires: &[],
        eval: |p, _| bit(p.has_flag(AnomalyFlag::AmbiguousIdentity)),
    },
    ProcessFeature {
        name: "child_count",
        requires: &[],
        eval: child_count,
    },
];

/// Processes naming this one as parent. Children created before the parent belong
/// to an earlier holder of the pid and are not counted.
fn child_count(p: &CanonicalProcess, img: &CanonicalImage) -> f64 {
    img.processes
        .values()
        .filter(|c| c.ppid == Some(p.pid) && c.pid != p.pid)
        .filter(|c| match (c.create_time, p.create_time) {
            (Some(child), Some(parent)) => child >= parent,
            _ => true,
        })
        .count() as f64
}
