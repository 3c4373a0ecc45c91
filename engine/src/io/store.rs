//! File-backed persistence for projects, chapters, runs, and knowledge notes.
//!
//! Layout under the store root:
//!
//! ```text
//! projects/<project_id>/project.json
//! projects/<project_id>/chapters/<number>.json
//! projects/<project_id>/knowledge/*.md|*.txt
//! projects/<project_id>/exports/<file>
//! runs/<run_id>.json
//! config.toml
//! ```
//!
//! Every JSON write is atomic (temp file + rename).

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::core::state::TelemetrySnapshot;
use crate::core::types::{Project, RunRecord, StoredChapter};
use crate::io::write_atomic;
use crate::telemetry::TelemetrySink;

/// A knowledge note attached to a project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnowledgeDocument {
    pub name: String,
    pub text: String,
}

/// Storage for projects and everything that hangs off them.
pub trait BookStore {
    fn load_project(&self, project_id: &str) -> Result<Project>;

    fn save_project(&self, project: &Project) -> Result<()>;

    /// All stored chapters, ordered by number.
    fn list_chapters(&self, project_id: &str) -> Result<Vec<StoredChapter>>;

    fn load_chapter(&self, project_id: &str, number: u32) -> Result<Option<StoredChapter>>;

    /// Insert or overwrite the chapter with the same number.
    fn save_chapter(&self, project_id: &str, chapter: &StoredChapter) -> Result<()>;

    /// Knowledge notes, ordered by name.
    fn knowledge_documents(&self, project_id: &str) -> Result<Vec<KnowledgeDocument>>;

    /// Store an export artifact and return where it went.
    fn write_export(&self, project_id: &str, file_name: &str, contents: &str) -> Result<String>;
}

/// Storage for run records.
pub trait RunStore {
    /// `Ok(None)` when no run has this id.
    fn load_run(&self, run_id: &str) -> Result<Option<RunRecord>>;

    fn save_run(&self, run: &RunRecord) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    fn project_dir(&self, project_id: &str) -> Result<PathBuf> {
        check_id(project_id, "project id")?;
        Ok(self.root.join("projects").join(project_id))
    }

    fn chapter_path(&self, project_id: &str, number: u32) -> Result<PathBuf> {
        Ok(self
            .project_dir(project_id)?
            .join("chapters")
            .join(format!("{number}.json")))
    }

    fn run_path(&self, run_id: &str) -> Result<PathBuf> {
        check_id(run_id, "run id")?;
        Ok(self.root.join("runs").join(format!("{run_id}.json")))
    }
}

/// Ids become path components; keep them to a safe alphabet.
fn check_id(id: &str, label: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !valid {
        bail!("{label} '{id}' must be non-empty and contain only [A-Za-z0-9_-]");
    }
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    write_atomic(path, &buf)
}

impl BookStore for FileStore {
    fn load_project(&self, project_id: &str) -> Result<Project> {
        let path = self.project_dir(project_id)?.join("project.json");
        if !path.exists() {
            bail!("project '{project_id}' not found");
        }
        read_json(&path)
    }

    fn save_project(&self, project: &Project) -> Result<()> {
        let path = self.project_dir(&project.id)?.join("project.json");
        debug!(project_id = %project.id, status = ?project.status, "saving project");
        write_json(&path, project)
    }

    fn list_chapters(&self, project_id: &str) -> Result<Vec<StoredChapter>> {
        let dir = self.project_dir(project_id)?.join("chapters");
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut chapters: Vec<StoredChapter> = Vec::new();
        for entry in fs::read_dir(&dir).with_context(|| format!("read {}", dir.display()))? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                chapters.push(read_json(&path)?);
            }
        }
        chapters.sort_by_key(|chapter| chapter.number);
        Ok(chapters)
    }

    fn load_chapter(&self, project_id: &str, number: u32) -> Result<Option<StoredChapter>> {
        let path = self.chapter_path(project_id, number)?;
        if !path.exists() {
            return Ok(None);
        }
        read_json(&path).map(Some)
    }

    fn save_chapter(&self, project_id: &str, chapter: &StoredChapter) -> Result<()> {
        let path = self.chapter_path(project_id, chapter.number)?;
        write_json(&path, chapter)
    }

    fn knowledge_documents(&self, project_id: &str) -> Result<Vec<KnowledgeDocument>> {
        let dir = self.project_dir(project_id)?.join("knowledge");
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut paths: Vec<PathBuf> = Vec::new();
        for entry in fs::read_dir(&dir).with_context(|| format!("read {}", dir.display()))? {
            let path = entry?.path();
            let is_note = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| matches!(ext, "md" | "txt"));
            if is_note && path.is_file() {
                paths.push(path);
            }
        }
        paths.sort();
        paths
            .into_iter()
            .map(|path| {
                let text = fs::read_to_string(&path)
                    .with_context(|| format!("read {}", path.display()))?;
                let name = path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_default();
                Ok(KnowledgeDocument { name, text })
            })
            .collect()
    }

    fn write_export(&self, project_id: &str, file_name: &str, contents: &str) -> Result<String> {
        let path = self.project_dir(project_id)?.join("exports").join(file_name);
        write_atomic(&path, contents)?;
        Ok(path.display().to_string())
    }
}

impl RunStore for FileStore {
    fn load_run(&self, run_id: &str) -> Result<Option<RunRecord>> {
        let path = self.run_path(run_id)?;
        if !path.exists() {
            return Ok(None);
        }
        read_json(&path).map(Some)
    }

    fn save_run(&self, run: &RunRecord) -> Result<()> {
        let path = self.run_path(&run.id)?;
        write_json(&path, run)
    }
}

/// Telemetry sink that writes snapshots into the run record.
///
/// Each write reads the run, replaces `output.progress`, merges
/// `timings.nodes`, and writes it back. Failures are logged and dropped.
pub struct RunTelemetrySink<'a, S: RunStore + ?Sized> {
    runs: &'a S,
}

impl<'a, S: RunStore + ?Sized> RunTelemetrySink<'a, S> {
    pub fn new(runs: &'a S) -> Self {
        Self { runs }
    }

    fn try_persist(&self, run_id: &str, snapshot: &TelemetrySnapshot) -> Result<()> {
        let Some(mut run) = self.runs.load_run(run_id)? else {
            debug!(run_id, "run not found; skipping telemetry write");
            return Ok(());
        };
        run.output.insert(
            "progress".to_string(),
            serde_json::to_value(&snapshot.progress)?,
        );
        let mut nodes = match run.timings.remove("nodes") {
            Some(Value::Object(nodes)) => nodes,
            _ => Map::new(),
        };
        for (key, ms) in snapshot.node_timings.iter() {
            nodes.insert(key.clone(), Value::from(*ms));
        }
        run.timings.insert("nodes".to_string(), Value::Object(nodes));
        self.runs.save_run(&run)
    }
}

impl<S: RunStore + ?Sized> TelemetrySink for RunTelemetrySink<'_, S> {
    fn persist(&self, run_id: &str, snapshot: &TelemetrySnapshot) {
        if let Err(err) = self.try_persist(run_id, snapshot) {
            warn!(run_id, err = %format!("{err:#}"), "failed to persist run node telemetry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{ChapterStatus, RunStatus};
    use crate::test_support::{project, run_record};
    use serde_json::json;

    #[test]
    fn project_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileStore::new(temp.path());
        let project = project();
        store.save_project(&project).expect("save");
        assert_eq!(store.load_project(&project.id).expect("load"), project);
    }

    #[test]
    fn missing_project_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileStore::new(temp.path());
        let err = store.load_project("nope").unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn ids_with_path_separators_are_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileStore::new(temp.path());
        assert!(store.load_project("../escape").is_err());
        assert!(store.load_run("a/b").is_err());
    }

    #[test]
    fn chapters_overwrite_by_number_and_list_in_order() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileStore::new(temp.path());
        for number in [10, 2, 1] {
            store
                .save_chapter("p1", &StoredChapter::pending(number, "Pending"))
                .expect("save");
        }
        let generated = StoredChapter {
            number: 2,
            title: "Two".to_string(),
            content: "body".to_string(),
            summary: "body".to_string(),
            status: ChapterStatus::Generated,
        };
        store.save_chapter("p1", &generated).expect("overwrite");

        let chapters = store.list_chapters("p1").expect("list");
        let numbers: Vec<u32> = chapters.iter().map(|chapter| chapter.number).collect();
        assert_eq!(numbers, vec![1, 2, 10]);
        assert_eq!(chapters[1], generated);
        assert_eq!(
            store.load_chapter("p1", 2).expect("load"),
            Some(generated)
        );
        assert_eq!(store.load_chapter("p1", 3).expect("load"), None);
    }

    #[test]
    fn knowledge_notes_are_filtered_and_sorted() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileStore::new(temp.path());
        let dir = temp.path().join("projects/p1/knowledge");
        fs::create_dir_all(&dir).expect("mkdir");
        fs::write(dir.join("b.txt"), "second").expect("write");
        fs::write(dir.join("a.md"), "first").expect("write");
        fs::write(dir.join("image.png"), "skip").expect("write");

        let docs = store.knowledge_documents("p1").expect("docs");
        let names: Vec<&str> = docs.iter().map(|doc| doc.name.as_str()).collect();
        assert_eq!(names, vec!["a.md", "b.txt"]);
        assert_eq!(docs[0].text, "first");
    }

    #[test]
    fn telemetry_sink_merges_into_run_record() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileStore::new(temp.path());
        let mut run = run_record("run-1", "p1", "chapter", json!({"chapter_number": 1}));
        run.timings
            .insert("nodes".to_string(), json!({"earlier_ms": 4}));
        run.output.insert("keep".to_string(), json!(true));
        store.save_run(&run).expect("save");

        let mut snapshot = TelemetrySnapshot::default();
        snapshot.progress = snapshot.progress.started("chapter_plan", 0);
        snapshot.node_timings = snapshot.node_timings.with("chapter_retrieve_context", 9);
        RunTelemetrySink::new(&store).persist("run-1", &snapshot);

        let stored = store.load_run("run-1").expect("load").expect("run");
        assert_eq!(stored.output["progress"]["current_node"], json!("chapter_plan"));
        assert_eq!(stored.output["keep"], json!(true));
        assert_eq!(
            Value::Object(stored.timings)["nodes"],
            json!({"earlier_ms": 4, "chapter_retrieve_context_ms": 9})
        );
        assert_eq!(stored.status, RunStatus::Queued);
    }

    #[test]
    fn telemetry_sink_ignores_missing_runs() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileStore::new(temp.path());
        RunTelemetrySink::new(&store).persist("ghost", &TelemetrySnapshot::default());
        assert!(store.load_run("ghost").expect("load").is_none());
    }

    #[test]
    fn export_lands_under_project_exports() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileStore::new(temp.path());
        let location = store.write_export("p1", "book.md", "# Book\n").expect("export");
        assert!(location.ends_with("book.md"));
        let written =
            fs::read_to_string(temp.path().join("projects/p1/exports/book.md")).expect("read");
        assert_eq!(written, "# Book\n");
    }
}
