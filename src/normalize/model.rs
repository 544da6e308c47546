//! Canonical artifact graph. References point at processes by pid (relation + lookup);
//! nothing holds a back-pointer.

use crate::parser::{ArtifactKind, ToolVersion};
use crate::warning::Warning;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Process identity within one dump. PIDs are reused; the create time disambiguates.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProcessKey {
    pub pid: u32,
    pub create_time: Option<DateTime<Utc>>,
}

impl fmt::Display for ProcessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.create_time {
            Some(t) => write!(f, "{}@{}", self.pid, t.format("%Y-%m-%dT%H:%M:%S%.6fZ")),
            None => write!(f, "{}", self.pid),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyFlag {
    /// Parent pid does not resolve to a process of the image
    NoResolvableParent,
    /// Found by pool scanning or cross-view but not in the active process list
    HiddenFromProcessList,
    /// Executable+writable region outside every loaded module of the process
    UnbackedExecutableRegion,
    /// Module missing from the loader's load or memory-order list
    UnlinkedModule,
    Exited,
    /// Shares its pid with another identity that could not be merged
    AmbiguousIdentity,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ModuleRef {
    pub pid: Option<u32>,
    pub base: Option<u64>,
    pub size: Option<u64>,
    pub name: Option<String>,
    pub path: Option<String>,
}

impl ModuleRef {
    pub fn contains(&self, addr: u64) -> bool {
        match (self.base, self.size) {
            (Some(base), Some(size)) => addr >= base && addr < base.saturating_add(size),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LdrModuleRef {
    pub pid: Option<u32>,
    pub base: Option<u64>,
    pub in_load: Option<bool>,
    pub in_init: Option<bool>,
    pub in_mem: Option<bool>,
    pub mapped_path: Option<String>,
}

impl LdrModuleRef {
    pub fn is_unlinked(&self) -> bool {
        self.in_load == Some(false) || self.in_mem == Some(false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HandleRef {
    pub pid: Option<u32>,
    pub handle_value: Option<u64>,
    pub offset: Option<u64>,
    /// Object type as reported (`File`, `Key`, `Mutant`, ...)
    pub object_type: Option<String>,
    pub granted_access: Option<String>,
    pub name: Option<String>,
}

impl HandleRef {
    pub fn is_type(&self, t: &str) -> bool {
        self.object_type.as_deref().map_or(false, |o| o.eq_ignore_ascii_case(t))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionRef {
    pub pid: Option<u32>,
    pub start: Option<u64>,
    pub end: Option<u64>,
    pub tag: Option<String>,
    pub protection: Option<String>,
    pub commit_charge: Option<u64>,
    pub private_memory: Option<bool>,
}

impl RegionRef {
    pub fn is_executable_writable(&self) -> bool {
        self.protection.as_deref().map_or(false, |p| {
            let p = p.to_ascii_uppercase();
            p.contains("EXECUTE") && p.contains("WRITE")
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRef {
    pub pid: Option<u32>,
    pub name: Option<String>,
    pub display: Option<String>,
    pub state: Option<String>,
    pub start: Option<String>,
    pub service_type: Option<String>,
    pub binary: Option<String>,
    pub dll: Option<String>,
}

impl ServiceRef {
    fn type_has(&self, needle: &str) -> bool {
        self.service_type.as_deref().map_or(false, |t| t.contains(needle))
    }

    pub fn is_kernel_driver(&self) -> bool {
        self.type_has("SERVICE_KERNEL_DRIVER")
    }

    pub fn is_fs_driver(&self) -> bool {
        self.type_has("SERVICE_FILE_SYSTEM_DRIVER")
    }

    pub fn is_own_process(&self) -> bool {
        self.type_has("SERVICE_WIN32_OWN_PROCESS")
    }

    pub fn is_shared_process(&self) -> bool {
        self.type_has("SERVICE_WIN32_SHARE_PROCESS")
    }

    pub fn is_interactive(&self) -> bool {
        self.type_has("SERVICE_INTERACTIVE_PROCESS")
    }

    pub fn is_running(&self) -> bool {
        self.state
            .as_deref()
            .map_or(false, |s| s.eq_ignore_ascii_case("SERVICE_RUNNING"))
    }
}

/// Cross-view presence of a process (psxview).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Visibility {
    pub pid: Option<u32>,
    pub pslist: Option<bool>,
    pub psscan: Option<bool>,
    pub thrdscan: Option<bool>,
    pub csrss: Option<bool>,
}

impl Visibility {
    /// Views that did not see the process.
    pub fn hidden_sources(&self) -> usize {
        [self.pslist, self.psscan, self.thrdscan, self.csrss]
            .iter()
            .filter(|v| **v == Some(false))
            .count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelModule {
    pub base: Option<u64>,
    pub size: Option<u64>,
    pub name: Option<String>,
    pub path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Callback {
    pub callback_type: Option<String>,
    pub address: Option<u64>,
    pub module: Option<String>,
    pub symbol: Option<String>,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsProfile {
    pub family: String,
    pub is_64bit: Option<bool>,
    pub nt_version: Option<String>,
    pub build_lab: Option<String>,
    pub product_type: Option<String>,
    pub processors: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalProcess {
    pub pid: u32,
    pub ppid: Option<u32>,
    pub name: Option<String>,
    pub create_time: Option<DateTime<Utc>>,
    pub exit_time: Option<DateTime<Utc>>,
    pub offset: Option<u64>,
    pub threads: Option<u64>,
    pub handle_count: Option<u64>,
    pub session_id: Option<u32>,
    pub wow64: Option<bool>,
    /// Process-list plugins that reported this identity
    pub sources: BTreeSet<String>,
    /// One entry per reported row, so per-process counts add up to the image totals
    pub loaded_modules: Vec<ModuleRef>,
    pub ldr_modules: Vec<LdrModuleRef>,
    pub open_handles: Vec<HandleRef>,
    pub memory_regions: Vec<RegionRef>,
    pub services: Vec<ServiceRef>,
    pub visibility: Option<Visibility>,
    pub flags: BTreeSet<AnomalyFlag>,
}

impl CanonicalProcess {
    pub fn key(&self) -> ProcessKey {
        ProcessKey {
            pid: self.pid,
            create_time: self.create_time,
        }
    }

    pub fn has_flag(&self, flag: AnomalyFlag) -> bool {
        self.flags.contains(&flag)
    }

    /// Executable+writable regions not inside any loaded module of this process.
    pub fn unbacked_executable_regions(&self) -> usize {
        self.memory_regions
            .iter()
            .filter(|r| r.is_executable_writable())
            .filter(|r| match r.start {
                Some(start) => !self.loaded_modules.iter().any(|m| m.contains(start)),
                None => true,
            })
            .count()
    }
}

/// Artifacts whose owner could not be resolved; kept so totals stay visible.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnresolvedArtifacts {
    pub modules: Vec<ModuleRef>,
    pub ldr_modules: Vec<LdrModuleRef>,
    pub handles: Vec<HandleRef>,
    pub regions: Vec<RegionRef>,
    pub services: Vec<ServiceRef>,
    pub visibility: Vec<Visibility>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PluginCoverage {
    Contributed { rows: usize },
    /// Output was rejected by the parser (no header)
    Rejected,
    Missing,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactCount {
    pub total: usize,
    pub resolved: usize,
    pub orphaned: usize,
}

/// Root of the artifact graph for one dump. Written once by the normalizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalImage {
    pub dump_id: String,
    pub os_profile: Option<OsProfile>,
    pub tool_version: Option<ToolVersion>,
    pub plugins: BTreeMap<String, PluginCoverage>,
    #[serde(serialize_with = "processes_as_seq", deserialize_with = "processes_from_seq")]
    pub processes: BTreeMap<ProcessKey, CanonicalProcess>,
    pub unresolved: UnresolvedArtifacts,
    pub kernel_modules: Vec<KernelModule>,
    pub callbacks: Vec<Callback>,
    /// Services not bound to a process (drivers, stopped services)
    pub services: Vec<ServiceRef>,
    pub image_level_counts: BTreeMap<ArtifactKind, ArtifactCount>,
    pub extraction_warnings: Vec<Warning>,
}

impl CanonicalImage {
    pub fn has_plugin(&self, plugin: &str) -> bool {
        matches!(self.plugins.get(plugin), Some(PluginCoverage::Contributed { .. }))
    }

    /// Every identity sharing `pid`, oldest first.
    pub fn processes_by_pid(&self, pid: u32) -> impl Iterator<Item = &CanonicalProcess> {
        self.processes
            .range(
                ProcessKey { pid, create_time: None }..=ProcessKey {
                    pid,
                    create_time: Some(DateTime::<Utc>::MAX_UTC),
                },
            )
            .map(|(_, p)| p)
    }

    pub fn count(&self, kind: ArtifactKind) -> ArtifactCount {
        self.image_level_counts.get(&kind).copied().unwrap_or_default()
    }

    pub fn warnings_of(&self, kind: &str) -> impl Iterator<Item = &Warning> + '_ {
        let kind = kind.to_string();
        self.extraction_warnings.iter().filter(move |w| w.kind() == kind)
    }
}

fn processes_as_seq<S: Serializer>(map: &BTreeMap<ProcessKey, CanonicalProcess>, s: S) -> Result<S::Ok, S::Error> {
    s.collect_seq(map.values())
}

fn processes_from_seq<'de, D: Deserializer<'de>>(d: D) -> Result<BTreeMap<ProcessKey, CanonicalProcess>, D::Error> {
    let list = Vec::<CanonicalProcess>::deserialize(d)?;
    Ok(list.into_iter().map(|p| (p.key(), p)).collect())
}
