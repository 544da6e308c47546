//! Plugin-schema registry: expected column layouts per plugin and tool version.
//!
//! Process-wide and read-only after first use. Output shape differences between
//! tool versions are expressed as additional layouts here, never as per-row
//! special cases in the parser or normalizer.

use super::ToolVersion;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::OnceLock;

pub const INFO: &str = "windows.info";
pub const PSLIST: &str = "windows.pslist";
pub const PSSCAN: &str = "windows.psscan";
pub const DLLLIST: &str = "windows.dlllist";
pub const LDRMODULES: &str = "windows.ldrmodules";
pub const HANDLES: &str = "windows.handles";
pub const MALFIND: &str = "windows.malfind";
pub const PSXVIEW: &str = "windows.psxview";
pub const SVCSCAN: &str = "windows.svcscan";
pub const MODULES: &str = "windows.modules";
pub const CALLBACKS: &str = "windows.callbacks";

/// Plugins run when the configuration does not name any.
pub const DEFAULT_PLUGINS: &[&str] = &[
    INFO, PSLIST, PSSCAN, DLLLIST, LDRMODULES, HANDLES, MALFIND, PSXVIEW, SVCSCAN, MODULES, CALLBACKS,
];

/// Category of artifact a plugin produces; the normalizer dispatches on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    SystemInfo,
    Processes,
    Modules,
    LdrModules,
    Handles,
    Regions,
    Visibility,
    Services,
    KernelModules,
    Callbacks,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::SystemInfo => "system_info",
            ArtifactKind::Processes => "processes",
            ArtifactKind::Modules => "modules",
            ArtifactKind::LdrModules => "ldr_modules",
            ArtifactKind::Handles => "handles",
            ArtifactKind::Regions => "regions",
            ArtifactKind::Visibility => "visibility",
            ArtifactKind::Services => "services",
            ArtifactKind::KernelModules => "kernel_modules",
            ArtifactKind::Callbacks => "callbacks",
        }
    }
}

/// How cells are separated on a data line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Delimiter {
    /// One tab between cells (framework 2.x text renderer).
    Tab,
    /// Runs of whitespace; the last column takes the remainder of the line.
    Whitespace,
    /// Space-aligned columns; cell boundaries are the header's column offsets.
    FixedWidth,
}

#[derive(Debug, Clone)]
pub struct ColumnLayout {
    pub id: &'static str,
    /// Oldest tool version emitting this layout
    pub since: ToolVersion,
    pub delimiter: Delimiter,
    pub columns: &'static [&'static str],
    /// Leading columns that identify the header line
    pub signature: usize,
    /// Bare lines after a row extend its last cell (hexdump / disassembly blocks)
    pub continuation: bool,
}

impl ColumnLayout {
    pub fn signature_columns(&self) -> &'static [&'static str] {
        &self.columns[..self.signature.min(self.columns.len())]
    }
}

#[derive(Debug, Clone)]
pub struct PluginSchema {
    pub plugin: &'static str,
    pub kind: ArtifactKind,
    /// Newest first
    pub layouts: Vec<ColumnLayout>,
}

impl PluginSchema {
    /// Layouts a tool of `version` may emit, newest first. All of them when the version is unknown.
    pub fn candidates(&self, version: Option<ToolVersion>) -> Vec<&ColumnLayout> {
        self.layouts
            .iter()
            .filter(|l| version.map_or(true, |v| l.since <= v))
            .collect()
    }
}

pub struct PluginRegistry {
    schemas: BTreeMap<&'static str, PluginSchema>,
}

static REGISTRY: OnceLock<PluginRegistry> = OnceLock::new();

const V1: ToolVersion = ToolVersion::new(1, 0, 0);
const V2: ToolVersion = ToolVersion::new(2, 0, 0);

const PROCESS_COLUMNS: &[&str] = &[
    "PID", "PPID", "ImageFileName", "Offset(V)", "Threads", "Handles", "SessionId", "Wow64", "CreateTime",
    "ExitTime", "File output",
];

fn layout(
    id: &'static str,
    since: ToolVersion,
    delimiter: Delimiter,
    columns: &'static [&'static str],
    signature: usize,
) -> ColumnLayout {
    ColumnLayout {
        id,
        since,
        delimiter,
        columns,
        signature,
        continuation: false,
    }
}

impl PluginRegistry {
    pub fn global() -> &'static PluginRegistry {
        REGISTRY.get_or_init(PluginRegistry::builtin)
    }

    pub fn get(&self, plugin: &str) -> Option<&PluginSchema> {
        self.schemas.get(plugin)
    }

    pub fn kind_of(&self, plugin: &str) -> Option<ArtifactKind> {
        self.get(plugin).map(|s| s.kind)
    }

    pub fn plugins(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.schemas.keys().copied()
    }

    fn builtin() -> Self {
        let pre_file_output = &PROCESS_COLUMNS[..PROCESS_COLUMNS.len() - 1];
        let schemas = vec![
            PluginSchema {
                plugin: INFO,
                kind: ArtifactKind::SystemInfo,
                layouts: vec![layout("info/1", V1, Delimiter::Tab, &["Variable", "Value"], 2)],
            },
            PluginSchema {
                plugin: PSLIST,
                kind: ArtifactKind::Processes,
                layouts: vec![
                    layout("pslist/2", V2, Delimiter::Tab, PROCESS_COLUMNS, 3),
                    layout("pslist/1", V1, Delimiter::FixedWidth, pre_file_output, 3),
                ],
            },
            PluginSchema {
                plugin: PSSCAN,
                kind: ArtifactKind::Processes,
                layouts: vec![
                    layout("psscan/2", V2, Delimiter::Tab, PROCESS_COLUMNS, 3),
                    layout("psscan/1", V1, Delimiter::FixedWidth, pre_file_output, 3),
                ],
            },
            PluginSchema {
                plugin: DLLLIST,
                kind: ArtifactKind::Modules,
                layouts: vec![
                    layout(
                        "dlllist/2",
                        V2,
                        Delimiter::Tab,
                        &["PID", "Process", "Base", "Size", "Name", "Path", "LoadTime", "File output"],
                        3,
                    ),
                    layout(
                        "dlllist/1",
                        V1,
                        Delimiter::FixedWidth,
                        &["PID", "Process", "Base", "Size", "Name", "Path"],
                        3,
                    ),
                ],
            },
            PluginSchema {
                plugin: LDRMODULES,
                kind: ArtifactKind::LdrModules,
                layouts: vec![layout(
                    "ldrmodules/1",
                    V1,
                    Delimiter::Tab,
                    &["Pid", "Process", "Base", "InLoad", "InInit", "InMem", "MappedPath"],
                    3,
                )],
            },
            PluginSchema {
                plugin: HANDLES,
                kind: ArtifactKind::Handles,
                layouts: vec![layout(
                    "handles/1",
                    V1,
                    Delimiter::Tab,
                    &["PID", "Process", "Offset", "HandleValue", "Type", "GrantedAccess", "Name"],
                    4,
                )],
            },
            PluginSchema {
                plugin: MALFIND,
                kind: ArtifactKind::Regions,
                layouts: vec![
                    ColumnLayout {
                        continuation: true,
                        ..layout(
                            "malfind/3",
                            ToolVersion::new(2, 5, 0),
                            Delimiter::Tab,
                            &[
                                "PID", "Process", "Start VPN", "End VPN", "Tag", "Protection", "CommitCharge",
                                "PrivateMemory", "File output", "Notes", "Hexdump", "Disasm",
                            ],
                            4,
                        )
                    },
                    ColumnLayout {
                        continuation: true,
                        ..layout(
                            "malfind/2",
                            V2,
                            Delimiter::Tab,
                            &[
                                "PID", "Process", "Start VPN", "End VPN", "Tag", "Protection", "CommitCharge",
                                "PrivateMemory", "File output", "Hexdump", "Disasm",
                            ],
                            4,
                        )
                    },
                ],
            },
            PluginSchema {
                plugin: PSXVIEW,
                kind: ArtifactKind::Visibility,
                layouts: vec![layout(
                    "psxview/1",
                    V1,
                    Delimiter::Tab,
                    &["Offset(Virtual)", "Name", "PID", "pslist", "psscan", "thrdscan", "csrss", "Exit Time"],
                    3,
                )],
            },
            PluginSchema {
                plugin: SVCSCAN,
                kind: ArtifactKind::Services,
                layouts: vec![
                    layout(
                        "svcscan/2",
                        ToolVersion::new(2, 4, 0),
                        Delimiter::Tab,
                        &[
                            "Offset", "Order", "PID", "Start", "State", "Type", "Name", "Display", "Binary",
                            "Binary (Registry)", "Dll",
                        ],
                        4,
                    ),
                    layout(
                        "svcscan/1",
                        V1,
                        Delimiter::Tab,
                        &["Offset", "Order", "PID", "Start", "State", "Type", "Name", "Display", "Binary"],
                        4,
                    ),
                ],
            },
            PluginSchema {
                plugin: MODULES,
                kind: ArtifactKind::KernelModules,
                layouts: vec![
                    layout(
                        "modules/2",
                        V2,
                        Delimiter::Tab,
                        &["Offset", "Base", "Size", "Name", "Path", "File output"],
                        4,
                    ),
                    layout(
                        "modules/1",
                        V1,
                        Delimiter::FixedWidth,
                        &["Offset", "Base", "Size", "Name", "Path"],
                        4,
                    ),
                ],
            },
            PluginSchema {
                plugin: CALLBACKS,
                kind: ArtifactKind::Callbacks,
                layouts: vec![layout(
                    "callbacks/1",
                    V1,
                    Delimiter::Tab,
                    &["Type", "Callback", "Module", "Symbol", "Detail"],
                    3,
                )],
            },
        ];

        Self {
            schemas: schemas.into_iter().map(|s| (s.plugin, s)).collect(),
        }
    }
}
