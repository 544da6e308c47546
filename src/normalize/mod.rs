//! Artifact normalizer: parsed tables of every plugin → one canonical artifact graph.
//!
//! Process identities are built first from the process-list plugins. A pid index is
//! built once after that pass and every other row is attached by lookup. Rows that
//! cannot be attached are kept on the image with an `orphan_reference` warning.

mod convert;
pub mod model;

pub use convert::{parse_bool, parse_int, parse_timestamp};
pub use model::{
    AnomalyFlag, ArtifactCount, Callback, CanonicalImage, CanonicalProcess, HandleRef, KernelModule,
    LdrModuleRef, ModuleRef, OsProfile, PluginCoverage, ProcessKey, RegionRef, ServiceRef, UnresolvedArtifacts,
    Visibility,
};

use crate::parser::registry::{PluginRegistry, PSLIST, PSSCAN};
use crate::parser::{ArtifactKind, ParsedTables, Row};
use crate::warning::Warning;
use chrono::{DateTime, Utc};
use convert::Cells;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

const SYSTEM_PID: u32 = 4;

pub struct Normalizer<'r> {
    registry: &'r PluginRegistry,
    expected: Vec<String>,
}

impl Normalizer<'static> {
    pub fn new<I, S>(expected: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_registry(PluginRegistry::global(), expected)
    }
}

impl<'r> Normalizer<'r> {
    pub fn with_registry<I, S>(registry: &'r PluginRegistry, expected: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            registry,
            expected: expected.into_iter().map(Into::into).collect(),
        }
    }

    /// Build the image. Never fails: every anomaly ends up in `extraction_warnings`.
    pub fn normalize(&self, dump_id: &str, parsed: &ParsedTables) -> CanonicalImage {
        let mut warnings = parsed.warnings.clone();
        let plugins = self.coverage(parsed, &mut warnings);
        let order = self.table_order(parsed);

        let mut identities = Identities::default();
        for (plugin, kind, rows) in &order {
            if *kind == Some(ArtifactKind::Processes) {
                for row in *rows {
                    identities.add(plugin, row, &mut warnings);
                }
            }
        }
        let processes = identities.into_map();
        let index = pid_index(&processes);

        let mut graph = Graph {
            processes,
            index,
            unresolved: UnresolvedArtifacts::default(),
            kernel_modules: Vec::new(),
            callbacks: Vec::new(),
            services: Vec::new(),
            os_profile: None,
            counts: BTreeMap::new(),
            warnings,
        };

        for (plugin, kind, rows) in &order {
            match kind {
                Some(ArtifactKind::Processes) => {}
                Some(ArtifactKind::SystemInfo) => graph.system_info(plugin, rows),
                Some(ArtifactKind::Modules) => graph.modules(rows),
                Some(ArtifactKind::LdrModules) => graph.ldr_modules(rows),
                Some(ArtifactKind::Handles) => graph.handles(rows),
                Some(ArtifactKind::Regions) => graph.regions(rows),
                Some(ArtifactKind::Visibility) => graph.visibility(rows),
                Some(ArtifactKind::Services) => graph.services(rows),
                Some(ArtifactKind::KernelModules) => graph.kernel_modules(rows),
                Some(ArtifactKind::Callbacks) => graph.callbacks(rows),
                None => debug!(plugin = %plugin, rows = rows.len(), "no artifact kind, table kept as parsed only"),
            }
        }

        let pslist_ran = parsed.tables.contains_key(PSLIST);
        graph.flag(pslist_ran);

        let process_total = graph.processes.len();
        graph.counts.insert(
            ArtifactKind::Processes,
            ArtifactCount {
                total: process_total,
                resolved: process_total,
                orphaned: 0,
            },
        );

        info!(
            dump_id,
            processes = process_total,
            orphans = graph.unresolved_len(),
            warnings = graph.warnings.len(),
            "image normalized"
        );

        CanonicalImage {
            dump_id: dump_id.to_string(),
            os_profile: graph.os_profile,
            tool_version: parsed.tool_version,
            plugins,
            processes: graph.processes,
            unresolved: graph.unresolved,
            kernel_modules: graph.kernel_modules,
            callbacks: graph.callbacks,
            services: graph.services,
            image_level_counts: graph.counts,
            extraction_warnings: graph.warnings,
        }
    }

    /// Coverage per plugin, plus one `missing_plugin` per expected plugin the
    /// parser has not already reported as `header_not_found`.
    fn coverage(&self, parsed: &ParsedTables, warnings: &mut Vec<Warning>) -> BTreeMap<String, PluginCoverage> {
        let rejected: BTreeSet<&str> = parsed
            .warnings
            .iter()
            .filter(|w| matches!(w, Warning::HeaderNotFound { .. }))
            .map(Warning::plugin)
            .collect();

        let mut plugins = BTreeMap::new();
        for (plugin, rows) in &parsed.tables {
            plugins.insert(plugin.clone(), PluginCoverage::Contributed { rows: rows.len() });
        }
        for plugin in &self.expected {
            if parsed.tables.contains_key(plugin) {
                continue;
            }
            if rejected.contains(plugin.as_str()) {
                plugins.insert(plugin.clone(), PluginCoverage::Rejected);
            } else {
                plugins.insert(plugin.clone(), PluginCoverage::Missing);
                warnings.push(Warning::MissingPlugin { plugin: plugin.clone() });
            }
        }
        plugins
    }

    /// Expected plugins in configured order, then any other table by name.
    fn table_order<'t>(&self, parsed: &'t ParsedTables) -> Vec<(&'t str, Option<ArtifactKind>, &'t [Row])> {
        let mut order = Vec::with_capacity(parsed.tables.len());
        for plugin in &self.expected {
            if let Some((name, rows)) = parsed.tables.get_key_value(plugin) {
                order.push((name.as_str(), self.registry.kind_of(name), rows.as_slice()));
            }
        }
        for (name, rows) in &parsed.tables {
            if !self.expected.iter().any(|e| e == name) {
                order.push((name.as_str(), self.registry.kind_of(name), rows.as_slice()));
            }
        }
        order
    }
}

fn rfc3339(t: &DateTime<Utc>) -> String {
    t.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

fn names_match(a: &Option<String>, b: &Option<String>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
        (None, None) => true,
        _ => false,
    }
}

/// Same process when create times agree (or one is unknown), or when they differ
/// but parent and image name match.
fn same_identity(a: &CanonicalProcess, b: &CanonicalProcess) -> bool {
    match (a.create_time, b.create_time) {
        (Some(x), Some(y)) if x != y => a.ppid == b.ppid && names_match(&a.name, &b.name),
        _ => true,
    }
}

fn merge(into: &mut CanonicalProcess, from: CanonicalProcess) {
    // None sorts first, so max keeps the later timestamp
    into.create_time = into.create_time.max(from.create_time);
    into.ppid = into.ppid.or(from.ppid);
    into.name = into.name.take().or(from.name);
    into.exit_time = into.exit_time.or(from.exit_time);
    into.offset = into.offset.or(from.offset);
    into.threads = into.threads.or(from.threads);
    into.handle_count = into.handle_count.or(from.handle_count);
    into.session_id = into.session_id.or(from.session_id);
    into.wow64 = into.wow64.or(from.wow64);
    into.sources.extend(from.sources);
    into.flags.extend(from.flags);
}

fn process_from_row(plugin: &str, row: &Row, warnings: &mut Vec<Warning>) -> Option<CanonicalProcess> {
    let before = warnings.len();
    let mut c = Cells::new(row, warnings);
    let pid = c.pid(&["PID"]);
    let ppid = c.pid(&["PPID"]);
    let name = c.text(&["ImageFileName", "Name"]);
    let create_time = c.time(&["CreateTime"]);
    let exit_time = c.time(&["ExitTime"]);
    let offset = c.int(&["Offset(V)", "Offset(P)", "Offset"]);
    let threads = c.int(&["Threads"]);
    let handle_count = c.int(&["Handles"]);
    let session_id = c.pid(&["SessionId"]);
    let wow64 = c.boolean(&["Wow64"]);

    let Some(pid) = pid else {
        let reported = warnings[before..]
            .iter()
            .any(|w| matches!(w, Warning::InvalidValue { column, .. } if column == "PID"));
        if !reported {
            warnings.push(Warning::InvalidValue {
                plugin: plugin.to_string(),
                line: row.line_number,
                column: "PID".to_string(),
                value: row.value("PID").unwrap_or_default().to_string(),
            });
        }
        return None;
    };

    Some(CanonicalProcess {
        pid,
        ppid,
        name,
        create_time,
        exit_time,
        offset,
        threads,
        handle_count,
        session_id,
        wow64,
        sources: BTreeSet::from([plugin.to_string()]),
        ..Default::default()
    })
}

/// Process identities under construction, grouped by pid.
#[derive(Default)]
struct Identities {
    list: Vec<CanonicalProcess>,
    by_pid: BTreeMap<u32, Vec<usize>>,
}

impl Identities {
    fn add(&mut self, plugin: &str, row: &Row, warnings: &mut Vec<Warning>) {
        let Some(mut p) = process_from_row(plugin, row, warnings) else {
            return;
        };
        let list = &mut self.list;
        let slots = self.by_pid.entry(p.pid).or_default();
        // An identical key wins over a looser match.
        let target = slots
            .iter()
            .copied()
            .find(|&i| p.create_time.is_some() && list[i].create_time == p.create_time)
            .or_else(|| slots.iter().copied().find(|&i| same_identity(&list[i], &p)));
        if let Some(i) = target {
            merge(&mut list[i], p);
            return;
        }
        if let Some(&first) = slots.first() {
            for &i in slots.iter() {
                list[i].flags.insert(AnomalyFlag::AmbiguousIdentity);
            }
            warnings.push(Warning::AmbiguousProcessIdentity {
                plugin: plugin.to_string(),
                line: row.line_number,
                pid: p.pid,
                existing: list[first].create_time.as_ref().map(rfc3339),
                reported: p.create_time.as_ref().map(rfc3339),
            });
            p.flags.insert(AnomalyFlag::AmbiguousIdentity);
        }
        slots.push(list.len());
        list.push(p);
    }

    fn into_map(self) -> BTreeMap<ProcessKey, CanonicalProcess> {
        let mut map = BTreeMap::new();
        for mut p in self.list {
            match map.entry(p.key()) {
                Entry::Vacant(e) => {
                    e.insert(p);
                }
                Entry::Occupied(mut e) => {
                    warn!(pid = p.pid, "process identities collapsed onto one key");
                    p.flags.insert(AnomalyFlag::AmbiguousIdentity);
                    merge(e.get_mut(), p);
                }
            }
        }
        map
    }
}

/// pid → identity that cross-references resolve to: live before exited, then latest create time.
fn pid_index(processes: &BTreeMap<ProcessKey, CanonicalProcess>) -> BTreeMap<u32, ProcessKey> {
    let rank = |p: &CanonicalProcess| (p.exit_time.is_none(), p.create_time);
    let mut best: BTreeMap<u32, &CanonicalProcess> = BTreeMap::new();
    for p in processes.values() {
        best.entry(p.pid)
            .and_modify(|cur| {
                if rank(p) > rank(cur) {
                    *cur = p;
                }
            })
            .or_insert(p);
    }
    best.into_iter().map(|(pid, p)| (pid, p.key())).collect()
}

/// Typed `windows.info` variable; unconvertible values are reported.
fn info_value<T>(
    plugin: &str,
    vars: &BTreeMap<&str, (&Row, &str)>,
    name: &str,
    convert: impl Fn(&str) -> Option<T>,
    warnings: &mut Vec<Warning>,
) -> Option<T> {
    let (row, value) = vars.get(name)?;
    let parsed = convert(value);
    if parsed.is_none() {
        warnings.push(Warning::InvalidValue {
            plugin: plugin.to_string(),
            line: row.line_number,
            column: name.to_string(),
            value: value.to_string(),
        });
    }
    parsed
}

struct Graph {
    processes: BTreeMap<ProcessKey, CanonicalProcess>,
    index: BTreeMap<u32, ProcessKey>,
    unresolved: UnresolvedArtifacts,
    kernel_modules: Vec<KernelModule>,
    callbacks: Vec<Callback>,
    services: Vec<ServiceRef>,
    os_profile: Option<OsProfile>,
    counts: BTreeMap<ArtifactKind, ArtifactCount>,
    warnings: Vec<Warning>,
}

impl Graph {
    /// Attach `item` to the process owning `pid`, or park it as an orphan.
    fn attach<T>(
        &mut self,
        row: &Row,
        kind: ArtifactKind,
        pid: Option<u32>,
        item: T,
        attach: impl FnOnce(&mut CanonicalProcess, T),
        park: impl FnOnce(&mut UnresolvedArtifacts, T),
    ) {
        let count = self.counts.entry(kind).or_default();
        count.total += 1;
        let owner = pid
            .and_then(|pid| self.index.get(&pid))
            .and_then(|key| self.processes.get_mut(key));
        match owner {
            Some(process) => {
                attach(process, item);
                count.resolved += 1;
            }
            None => {
                park(&mut self.unresolved, item);
                count.orphaned += 1;
                self.warnings.push(Warning::OrphanReference {
                    plugin: row.source_plugin.to_string(),
                    line: row.line_number,
                    artifact: kind,
                    pid,
                });
            }
        }
    }

    fn image_level(&mut self, kind: ArtifactKind) {
        let count = self.counts.entry(kind).or_default();
        count.total += 1;
        count.resolved += 1;
    }

    fn unresolved_len(&self) -> usize {
        self.counts.values().map(|c| c.orphaned).sum()
    }

    fn system_info(&mut self, plugin: &str, rows: &[Row]) {
        let vars: BTreeMap<&str, (&Row, &str)> = rows
            .iter()
            .filter_map(|row| Some((row.value("Variable")?, (row, row.value("Value")?.trim()))))
            .collect();
        let text = |name: &str| vars.get(name).map(|(_, v)| v.to_string()).filter(|v| !v.is_empty());
        let nt_version = match (text("NtMajorVersion"), text("NtMinorVersion")) {
            (Some(major), Some(minor)) => Some(format!("{major}.{minor}")),
            (major, _) => major,
        };

        self.os_profile = Some(OsProfile {
            family: plugin.split('.').next().unwrap_or(plugin).to_string(),
            is_64bit: info_value(plugin, &vars, "Is64Bit", parse_bool, &mut self.warnings),
            nt_version,
            build_lab: text("NTBuildLab"),
            product_type: text("NtProductType"),
            processors: info_value(plugin, &vars, "KeNumberProcessors", parse_int, &mut self.warnings),
        });
        for _ in rows {
            self.image_level(ArtifactKind::SystemInfo);
        }
    }

    fn modules(&mut self, rows: &[Row]) {
        for row in rows {
            let mut c = Cells::new(row, &mut self.warnings);
            let pid = c.pid(&["PID", "Pid"]);
            let module = ModuleRef {
                pid,
                base: c.int(&["Base"]),
                size: c.int(&["Size"]),
                name: c.text(&["Name"]),
                path: c.text(&["Path"]),
            };
            self.attach(
                row,
                ArtifactKind::Modules,
                pid,
                module,
                |p, m| {
                    p.loaded_modules.push(m);
                },
                |u, m| u.modules.push(m),
            );
        }
    }

    fn ldr_modules(&mut self, rows: &[Row]) {
        for row in rows {
            let mut c = Cells::new(row, &mut self.warnings);
            let pid = c.pid(&["Pid", "PID"]);
            let module = LdrModuleRef {
                pid,
                base: c.int(&["Base"]),
                in_load: c.boolean(&["InLoad"]),
                in_init: c.boolean(&["InInit"]),
                in_mem: c.boolean(&["InMem"]),
                mapped_path: c.text(&["MappedPath"]),
            };
            self.attach(
                row,
                ArtifactKind::LdrModules,
                pid,
                module,
                |p, m| {
                    p.ldr_modules.push(m);
                },
                |u, m| u.ldr_modules.push(m),
            );
        }
    }

    fn handles(&mut self, rows: &[Row]) {
        for row in rows {
            let mut c = Cells::new(row, &mut self.warnings);
            let pid = c.pid(&["PID", "Pid"]);
            let handle = HandleRef {
                pid,
                handle_value: c.int(&["HandleValue"]),
                offset: c.int(&["Offset"]),
                object_type: c.text(&["Type"]),
                granted_access: c.text(&["GrantedAccess"]),
                name: c.text(&["Name"]),
            };
            self.attach(
                row,
                ArtifactKind::Handles,
                pid,
                handle,
                |p, h| {
                    p.open_handles.push(h);
                },
                |u, h| u.handles.push(h),
            );
        }
    }

    fn regions(&mut self, rows: &[Row]) {
        for row in rows {
            let mut c = Cells::new(row, &mut self.warnings);
            let pid = c.pid(&["PID", "Pid"]);
            let region = RegionRef {
                pid,
                start: c.int(&["Start VPN"]),
                end: c.int(&["End VPN"]),
                tag: c.text(&["Tag"]),
                protection: c.text(&["Protection"]),
                commit_charge: c.int(&["CommitCharge"]),
                private_memory: c.boolean(&["PrivateMemory"]),
            };
            self.attach(
                row,
                ArtifactKind::Regions,
                pid,
                region,
                |p, r| p.memory_regions.push(r),
                |u, r| u.regions.push(r),
            );
        }
    }

    fn visibility(&mut self, rows: &[Row]) {
        for row in rows {
            let mut c = Cells::new(row, &mut self.warnings);
            let pid = c.pid(&["PID"]);
            let vis = Visibility {
                pid,
                pslist: c.boolean(&["pslist"]),
                psscan: c.boolean(&["psscan"]),
                thrdscan: c.boolean(&["thrdscan"]),
                csrss: c.boolean(&["csrss"]),
            };
            self.attach(
                row,
                ArtifactKind::Visibility,
                pid,
                vis,
                |p, v| p.visibility = Some(v),
                |u, v| u.visibility.push(v),
            );
        }
    }

    /// Services with no pid (stopped services, drivers) belong to the image.
    fn services(&mut self, rows: &[Row]) {
        for row in rows {
            let mut c = Cells::new(row, &mut self.warnings);
            let pid_text = c.text(&["PID"]);
            let pid = c.pid(&["PID"]);
            let service = ServiceRef {
                pid,
                name: c.text(&["Name"]),
                display: c.text(&["Display"]),
                state: c.text(&["State"]),
                start: c.text(&["Start"]),
                service_type: c.text(&["Type"]),
                binary: c.text(&["Binary"]),
                dll: c.text(&["Dll"]),
            };
            if pid_text.is_none() {
                self.image_level(ArtifactKind::Services);
                self.services.push(service);
                continue;
            }
            self.attach(
                row,
                ArtifactKind::Services,
                pid,
                service,
                |p, s| p.services.push(s),
                |u, s| u.services.push(s),
            );
        }
    }

    fn kernel_modules(&mut self, rows: &[Row]) {
        for row in rows {
            let mut c = Cells::new(row, &mut self.warnings);
            let module = KernelModule {
                base: c.int(&["Base"]),
                size: c.int(&["Size"]),
                name: c.text(&["Name"]),
                path: c.text(&["Path"]),
            };
            self.kernel_modules.push(module);
            self.image_level(ArtifactKind::KernelModules);
        }
    }

    fn callbacks(&mut self, rows: &[Row]) {
        for row in rows {
            let mut c = Cells::new(row, &mut self.warnings);
            let callback = Callback {
                callback_type: c.text(&["Type"]),
                address: c.int(&["Callback"]),
                module: c.text(&["Module"]),
                symbol: c.text(&["Symbol"]),
                detail: c.text(&["Detail"]),
            };
            self.callbacks.push(callback);
            self.image_level(ArtifactKind::Callbacks);
        }
    }

    fn flag(&mut self, pslist_ran: bool) {
        let live_pids: BTreeSet<u32> = self.index.keys().copied().collect();
        for p in self.processes.values_mut() {
            if let Some(ppid) = p.ppid {
                if ppid != 0 && p.pid != SYSTEM_PID && !live_pids.contains(&ppid) {
                    p.flags.insert(AnomalyFlag::NoResolvableParent);
                }
            }
            let scanned_only = pslist_ran && p.sources.contains(PSSCAN) && !p.sources.contains(PSLIST);
            let cross_view_hidden = p.visibility.as_ref().map_or(false, |v| v.pslist == Some(false));
            if p.exit_time.is_none() && (scanned_only || cross_view_hidden) {
                p.flags.insert(AnomalyFlag::HiddenFromProcessList);
            }
            if p.unbacked_executable_regions() > 0 {
                p.flags.insert(AnomalyFlag::UnbackedExecutableRegion);
            }
            if p.ldr_modules.iter().any(LdrModuleRef::is_unlinked) {
                p.flags.insert(AnomalyFlag::UnlinkedModule);
            }
            if p.exit_time.is_some() {
                p.flags.insert(AnomalyFlag::Exited);
            }
        }
    }
}
