//! Evaluates a schema against a canonical image.

use super::schema::{schema, FeatureSchema, FeatureSpec};
use super::{Feature, FeatureVector, Scope, SENTINEL};
use crate::error::{PipelineError, PipelineResult};
use crate::normalize::{CanonicalImage, CanonicalProcess};
use tracing::debug;

fn covered<F>(spec: &FeatureSpec<F>, image: &CanonicalImage) -> bool {
    spec.requires.iter().all(|p| image.has_plugin(p))
}

fn finite(v: f64) -> f64 {
    if v.is_finite() {
        v
    } else {
        SENTINEL
    }
}

pub fn extract_image_features(image: &CanonicalImage, schema: &FeatureSchema) -> FeatureVector {
    let features = schema
        .image
        .iter()
        .map(|spec| Feature {
            name: spec.name.to_string(),
            value: if covered(spec, image) {
                finite((spec.eval)(image))
            } else {
                SENTINEL
            },
        })
        .collect();
    FeatureVector {
        schema_version: schema.version,
        layout_hash: schema.layout_hash(Scope::Image).to_string(),
        scope: Scope::Image,
        key_id: image.dump_id.clone(),
        features,
    }
}

pub fn extract_process_features(
    process: &CanonicalProcess,
    image: &CanonicalImage,
    schema: &FeatureSchema,
) -> FeatureVector {
    let features = schema
        .process
        .iter()
        .map(|spec| Feature {
            name: spec.name.to_string(),
            value: if covered(spec, image) {
                finite((spec.eval)(process, image))
            } else {
                SENTINEL
            },
        })
        .collect();
    FeatureVector {
        schema_version: schema.version,
        layout_hash: schema.layout_hash(Scope::Process).to_string(),
        scope: Scope::Process,
        key_id: process.key().to_string(),
        features,
    }
}

/// Extractor bound to one schema version.
pub struct FeatureExtractor {
    schema: &'static FeatureSchema,
}

impl FeatureExtractor {
    pub fn new(version: u16) -> PipelineResult<Self> {
        let schema = schema(version).ok_or(PipelineError::UnknownSchema(version))?;
        Ok(Self { schema })
    }

    pub fn schema(&self) -> &'static FeatureSchema {
        self.schema
    }

    pub fn image(&self, image: &CanonicalImage) -> FeatureVector {
        extract_image_features(image, self.schema)
    }

    /// One vector per process, in process-key order.
    pub fn processes(&self, image: &CanonicalImage) -> Vec<FeatureVector> {
        let vectors: Vec<FeatureVector> = image
            .processes
            .values()
            .map(|p| extract_process_features(p, image, self.schema))
            .collect();
        debug!(
            schema_version = self.schema.version,
            processes = vectors.len(),
            "process features extracted"
        );
        vectors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::Normalizer;
    use crate::parser::registry::{DEFAULT_PLUGINS, HANDLES, PSLIST};
    use crate::parser::{ParsedTables, Row};

    fn pslist_row(line: usize, pid: &str, ppid: &str, name: &str) -> Row {
        Row::from_pairs(
            PSLIST,
            line,
            &[
                ("PID", pid),
                ("PPID", ppid),
                ("ImageFileName", name),
                ("Threads", "3"),
                ("Handles", "20"),
                ("CreateTime", "2024-01-01 10:00:00 UTC"),
            ],
        )
    }

    fn image(with_handles: bool) -> CanonicalImage {
        let mut t = ParsedTables::default();
        t.insert(
            PSLIST,
            vec![
                pslist_row(3, "4", "0", "System"),
                pslist_row(4, "300", "4", "smss.exe"),
                pslist_row(5, "500", "300", "winlogon.exe"),
            ],
        );
        if with_handles {
            t.insert(
                HANDLES,
                vec![
                    Row::from_pairs(HANDLES, 3, &[("PID", "500"), ("HandleValue", "0x4"), ("Type", "File")]),
                    Row::from_pairs(HANDLES, 4, &[("PID", "4242"), ("HandleValue", "0x8"), ("Type", "Mutant")]),
                ],
            );
        }
        Normalizer::new([PSLIST, HANDLES]).normalize("dump-a", &t)
    }

    #[test]
    fn unresolved_handle_counts_in_graph_features() {
        let x = FeatureExtractor::new(2).unwrap();
        let v = x.image(&image(true));
        assert_eq!(v.get("pslist.nproc"), Some(3.0));
        assert_eq!(v.get("graph.unresolved_handles"), Some(1.0));
        assert_eq!(v.get("handles.nhandles"), Some(2.0));
        assert_eq!(v.get("handles.nmutant"), Some(1.0));
        assert_eq!(v.get("pslist.avg_threads"), Some(3.0));
    }

    #[test]
    fn missing_plugin_features_are_sentinel() {
        let x = FeatureExtractor::new(2).unwrap();
        let v = x.image(&image(false));
        assert_eq!(v.get("handles.nhandles"), Some(SENTINEL));
        assert_eq!(v.get("graph.unresolved_handles"), Some(SENTINEL));
        assert_eq!(v.get("pslist.nproc"), Some(3.0));
        for p in x.processes(&image(false)) {
            assert_eq!(p.get("handle_count"), Some(SENTINEL));
            assert_eq!(p.get("threads"), Some(3.0));
        }
    }

    #[test]
    fn shape_is_fixed_even_for_an_empty_image() {
        let x = FeatureExtractor::new(2).unwrap();
        let empty = Normalizer::new(DEFAULT_PLUGINS.iter().copied()).normalize("empty", &ParsedTables::default());
        let full = image(true);
        let (a, b) = (x.image(&empty), x.image(&full));
        assert_eq!(a.names().collect::<Vec<_>>(), b.names().collect::<Vec<_>>());
        assert_eq!(a.layout_hash, b.layout_hash);
        assert!(a.values().iter().all(|v| !v.is_nan()));
        assert!(x.processes(&empty).is_empty());
    }

    #[test]
    fn process_vectors_follow_key_order_and_graph() {
        let x = FeatureExtractor::new(2).unwrap();
        let img = image(true);
        let vs = x.processes(&img);
        let keys: Vec<_> = vs.iter().map(|v| v.key_id.clone()).collect();
        assert_eq!(keys[0], "4@2024-01-01T10:00:00.000000Z");
        assert_eq!(keys.len(), 3);
        assert_eq!(vs[0].get("child_count"), Some(1.0));
        assert_eq!(vs[2].get("file_handle_count"), Some(1.0));
        assert_eq!(vs[2].get("parent_resolvable"), Some(1.0));
    }

    #[test]
    fn repeated_handle_rows_count_the_same_per_process_and_per_image() {
        let mut t = ParsedTables::default();
        t.insert(PSLIST, vec![pslist_row(3, "500", "4", "winlogon.exe")]);
        let dup = |line| Row::from_pairs(HANDLES, line, &[("PID", "500"), ("HandleValue", "0x4"), ("Type", "File")]);
        t.insert(HANDLES, vec![dup(3), dup(4)]);
        let img = Normalizer::new([PSLIST, HANDLES]).normalize("dump-b", &t);

        let x = FeatureExtractor::new(2).unwrap();
        assert_eq!(x.image(&img).get("handles.nhandles"), Some(2.0));
        assert_eq!(x.processes(&img)[0].get("handle_count"), Some(2.0));
    }

    #[test]
    fn unknown_schema_is_an_error() {
        assert!(matches!(FeatureExtractor::new(7), Err(PipelineError::UnknownSchema(7))));
    }
}
