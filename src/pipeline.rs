//! The pipeline stages. Each stage maps one input file to one output artifact.

use std::{
    error::Error,
    fmt::Write as _,
    path::{Path, PathBuf},
};

use rustc_hash::FxHashMap;

use crate::{
    batch::{self, WorkerPool},
    classifier::{error_marker, ChatClient, Classifier, LlmError, RetryPolicy},
    prompt::{self, Judgment, Stance, Technique},
    record::{self, LoadError, RevisionRecord, Table},
};

const SEPARATOR_WIDTH: usize = 80;

#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("failed to load input")]
    Load(#[from] LoadError),
    #[error("failed to serialize record")]
    Json(#[from] serde_json::Error),
    #[error("failed to encode records")]
    Encode(#[source] std::io::Error),
    #[error("failed to write CSV")]
    Csv(#[from] csv::Error),
    #[error("failed to write `{}`", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("column `{0}` not found")]
    MissingColumn(String),
    #[error("processing panicked: {0}")]
    Panicked(String),
}

/// Render an error with all of its sources, `outer: inner: innermost`.
pub fn error_chain(err: &dyn Error) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let _ = write!(text, ": {cause}");
        source = cause.source();
    }
    text
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileSummary {
    pub records: usize,
    /// Records sent to the model
    pub classified: usize,
    /// Model calls that ended up as an error marker
    pub failed_calls: usize,
}

/// The complete contents of one output file.
#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    pub contents: Vec<u8>,
    pub summary: FileSummary,
}

pub trait FileStage: Sync {
    fn name(&self) -> &'static str;

    /// Where the artifact for `input` goes.
    fn output_path(&self, output_dir: &Path, input: &Path) -> PathBuf;

    /// Read `input` and build its artifact. Must not write any files.
    fn process(&self, input: &Path) -> Result<Artifact, StageError>;
}

/// Incrementally builds the text report shared by the judging stages.
#[derive(Debug, Default)]
struct Report {
    text: String,
    summary: FileSummary,
    labels: FxHashMap<&'static str, usize>,
}

impl Report {
    fn push_entry(&mut self, number: usize, version: &str, analysis: &str) {
        let _ = writeln!(self.text, "Record {number} (Version: {version}):");
        let _ = writeln!(self.text, "{analysis}");
        self.text.push_str(&"-".repeat(SEPARATOR_WIDTH));
        self.text.push('\n');
    }

    /// Ask the model, falling back to the error marker, and record the label it answered with.
    fn classify(
        &mut self,
        classifier: &Classifier<'_>,
        prompt: &str,
        label_of: impl Fn(&str) -> Option<&'static str>,
    ) -> String {
        self.summary.classified += 1;
        match classifier.classify_or_marker(prompt) {
            Ok(analysis) => {
                let label = label_of(&analysis).unwrap_or("unlabelled");
                *self.labels.entry(label).or_default() += 1;
                analysis
            }
            Err(marker) => {
                self.summary.failed_calls += 1;
                *self.labels.entry("failed").or_default() += 1;
                marker
            }
        }
    }

    fn finish(self, stage: &'static str, input: &Path) -> Artifact {
        let mut labels: Vec<_> = self.labels.into_iter().collect();
        labels.sort_unstable();
        tracing::info!(
            message = "Label counts",
            stage,
            input = %input.display(),
            labels = ?labels
        );

        Artifact {
            contents: self.text.into_bytes(),
            summary: self.summary,
        }
    }
}

/// Adds the line and word decomposition to every diff record.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnrichStage;

impl FileStage for EnrichStage {
    fn name(&self) -> &'static str {
        "enrich"
    }

    fn output_path(&self, output_dir: &Path, input: &Path) -> PathBuf {
        batch::output_path(output_dir, input, "", "_enriched.jsonl")
    }

    fn process(&self, input: &Path) -> Result<Artifact, StageError> {
        let mut records = record::load_jsonl(input)?;

        let mut diffs = 0;
        let mut first: Option<chrono::DateTime<chrono::Utc>> = None;
        let mut last: Option<chrono::DateTime<chrono::Utc>> = None;
        for record in &mut records {
            record.enrich();
            if let Some(revision) = record.as_diff() {
                diffs += 1;
                if let Some(timestamp) = revision.parsed_timestamp() {
                    first = Some(first.map_or(timestamp, |first| first.min(timestamp)));
                    last = Some(last.map_or(timestamp, |last| last.max(timestamp)));
                }
            }
        }

        tracing::info!(
            message = "Enriched records",
            input = %input.display(),
            records = records.len(),
            diffs,
            first_revision = ?first,
            last_revision = ?last
        );

        let mut contents = Vec::new();
        record::write_jsonl(&mut contents, &records).map_err(StageError::Encode)?;

        Ok(Artifact {
            contents,
            summary: FileSummary {
                records: records.len(),
                ..FileSummary::default()
            },
        })
    }
}

/// Asks the model whether each revision weaponises the article's narrative.
#[derive(Clone, Copy)]
pub struct DetectStage<'c> {
    classifier: Classifier<'c>,
}

impl<'c> DetectStage<'c> {
    pub fn new(client: &'c dyn ChatClient, retry: &'c RetryPolicy) -> Self {
        Self {
            classifier: Classifier::new(client, retry).with_system_prompt(prompt::SYSTEM_PROMPT),
        }
    }

    fn analyse(&self, record: &mut RevisionRecord, report: &mut Report) -> Result<String, StageError> {
        record.enrich();
        let record_json = serde_json::to_string_pretty(record)?;
        Ok(report.classify(
            &self.classifier,
            &prompt::detection_prompt(&record_json),
            |analysis| Judgment::find_in(analysis).map(|judgment| judgment.as_str()),
        ))
    }
}

impl FileStage for DetectStage<'_> {
    fn name(&self) -> &'static str {
        "detect"
    }

    fn output_path(&self, output_dir: &Path, input: &Path) -> PathBuf {
        batch::output_path(output_dir, input, "_enriched", "_analysis.txt")
    }

    fn process(&self, input: &Path) -> Result<Artifact, StageError> {
        let records = record::load_jsonl(input)?;

        let mut report = Report::default();
        report.summary.records = records.len();
        for (index, mut record) in records.into_iter().enumerate() {
            let analysis = self.analyse(&mut record, &mut report)?;
            tracing::debug!(
                message = "Judged record",
                input = %input.display(),
                record = index + 1,
                version = record.version()
            );
            report.push_entry(index + 1, record.version(), &analysis);
        }

        Ok(report.finish(self.name(), input))
    }
}

/// Asks the model which side the already weaponised revisions of a judged CSV favour.
#[derive(Clone, Copy)]
pub struct StanceStage<'c> {
    classifier: Classifier<'c>,
}

impl<'c> StanceStage<'c> {
    pub fn new(client: &'c dyn ChatClient, retry: &'c RetryPolicy) -> Self {
        Self {
            classifier: Classifier::new(client, retry).with_system_prompt(prompt::SYSTEM_PROMPT),
        }
    }
}

impl FileStage for StanceStage<'_> {
    fn name(&self) -> &'static str {
        "stance"
    }

    fn output_path(&self, output_dir: &Path, input: &Path) -> PathBuf {
        batch::output_path(output_dir, input, "_output", "_finegrained_analysis.txt")
    }

    fn process(&self, input: &Path) -> Result<Artifact, StageError> {
        let rows = record::load_judged_csv(input)?;

        let mut report = Report::default();
        report.summary.records = rows.len();
        for (index, row) in rows.iter().enumerate() {
            if !row.is_weaponised() {
                continue;
            }

            let row_json = serde_json::to_string_pretty(row)?;
            let analysis = report.classify(
                &self.classifier,
                &prompt::stance_prompt(&row_json),
                |analysis| Stance::find_in(analysis).map(|stance| stance.as_str()),
            );
            tracing::debug!(
                message = "Judged row",
                input = %input.display(),
                row = index + 1,
                source = %row.source
            );
            report.push_entry(index + 1, row.version().unwrap_or("N/A"), &analysis);
        }

        Ok(report.finish(self.name(), input))
    }
}

/// Label every row of `table` with one weaponisation technique, based on the free-text analysis in
/// column `column`. Returns one label per row, in row order.
///
/// Rows are classified concurrently on `pool`. A row whose call fails gets the error marker.
pub fn categorize_table(
    table: &Table,
    column: usize,
    classifier: &Classifier<'_>,
    pool: &WorkerPool,
) -> Vec<String> {
    let results = pool.map(table.rows.iter().enumerate(), |(index, row)| {
        let analysis = row.get(column).unwrap_or_default();
        let label = match classifier.classify_or_marker(&prompt::technique_prompt(analysis)) {
            Ok(answer) => prompt::clean_label(&answer),
            Err(marker) => return marker,
        };

        if !Technique::ALL.iter().any(|technique| technique.as_str() == label) {
            tracing::warn!(message = "Model answered with an unknown technique", row = index + 1, label = %label);
        } else {
            tracing::debug!(message = "Categorized row", row = index + 1, label = %label);
        }
        label
    });

    results
        .into_iter()
        .map(|result| {
            result.unwrap_or_else(|panic| error_marker(&LlmError::InvalidResponse(panic.to_string())))
        })
        .collect()
}

/// Read the CSV file `input`, label each row from its `column` and write the table with the
/// appended `weaponization_technique` column to `output`. Returns the number of rows.
pub fn categorize_file(
    input: &Path,
    output: &Path,
    column: &str,
    classifier: &Classifier<'_>,
    pool: &WorkerPool,
) -> Result<usize, StageError> {
    const TECHNIQUE_COLUMN: &str = "weaponization_technique";

    let table = Table::load(input)?;
    let index = table
        .column(column)
        .ok_or_else(|| StageError::MissingColumn(column.to_string()))?;

    tracing::info!(
        message = "Categorizing rows",
        input = %input.display(),
        rows = table.rows.len(),
        workers = pool.workers()
    );
    let labels = categorize_table(&table, index, classifier, pool);

    let mut counts: FxHashMap<&str, usize> = FxHashMap::default();
    for label in &labels {
        *counts.entry(label.as_str()).or_default() += 1;
    }
    let mut counts: Vec<_> = counts.into_iter().collect();
    counts.sort_unstable();
    tracing::info!(message = "Technique counts", input = %input.display(), counts = ?counts);

    let mut contents = Vec::new();
    table.write_with_column(&mut contents, TECHNIQUE_COLUMN, &labels)?;
    std::fs::write(output, contents).map_err(|source| StageError::Write {
        path: output.to_path_buf(),
        source,
    })?;

    Ok(labels.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::prelude::*;
    use std::{io::Cursor, time::Duration};

    fn no_retry() -> RetryPolicy {
        RetryPolicy::new(0, Duration::ZERO, Duration::ZERO, 0.0)
    }

    fn artifact_text(artifact: &Artifact) -> &str {
        std::str::from_utf8(&artifact.contents).unwrap()
    }

    #[test]
    fn test_enrich_stage() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_revision_file(
            dir.path(),
            "Ani.jsonl",
            &[
                first_version_record("Ani is a ruined city."),
                diff_record("@@ -1 +1 @@\n-Ani is a ruined city.\n+Ani is a ruined Armenian city."),
            ],
        );

        let stage = EnrichStage;
        assert_eq!(
            stage.output_path(Path::new("out"), &input),
            Path::new("out/Ani_enriched.jsonl")
        );

        let artifact = stage.process(&input).unwrap();
        assert_eq!(artifact.summary.records, 2);
        assert_eq!(artifact.summary.classified, 0);

        let records: Vec<RevisionRecord> =
            record::read_jsonl(Cursor::new(&artifact.contents)).unwrap();
        assert_eq!(records.len(), 2);
        let decomposition = records[1].as_diff().unwrap().decomposition.as_ref().unwrap();
        assert_eq!(decomposition.added_words, vec!["Armenian".to_string()]);
        assert!(decomposition.removed_words.is_empty());
    }

    #[test]
    fn test_enrich_stage_rejects_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("broken.jsonl");
        std::fs::write(&input, "{\"version\": \"diff\", \"Diff\": \"\"}\n{not json\n").unwrap();

        let err = EnrichStage.process(&input).unwrap_err();
        assert!(matches!(
            err,
            StageError::Load(LoadError::MalformedJson { line: 2, .. })
        ));
        assert!(error_chain(&err).starts_with("failed to load input: malformed record on line 2: "));
    }

    #[test]
    fn test_detect_stage_report() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_revision_file(
            dir.path(),
            "Julfa_enriched.jsonl",
            &[
                first_version_record("Julfa cemetery"),
                diff_record("-khachkars destroyed\n+khachkars removed"),
            ],
        );

        let client = ScriptedClient::new(|prompt| {
            Ok(if prompt.contains("\"Removed_Words\": [\n    \"destroyed\"") {
                "Judgment: Weaponised\nExplanation: softened wording".to_string()
            } else {
                "Judgment: Not Weaponised".to_string()
            })
        });
        let retry = no_retry();
        let stage = DetectStage::new(&client, &retry);

        assert_eq!(
            stage.output_path(Path::new("out"), &input),
            Path::new("out/Julfa_analysis.txt")
        );

        let artifact = stage.process(&input).unwrap();
        let separator = "-".repeat(80);
        assert_eq!(
            artifact_text(&artifact),
            format!(
                "Record 1 (Version: first_version):\nJudgment: Not Weaponised\n{separator}\n\
                 Record 2 (Version: diff):\nJudgment: Weaponised\nExplanation: softened wording\n{separator}\n"
            )
        );
        assert_eq!(
            artifact.summary,
            FileSummary {
                records: 2,
                classified: 2,
                failed_calls: 0
            }
        );

        let requests = client.requests();
        assert_eq!(requests.len(), 2);
        assert!(requests
            .iter()
            .all(|(system, _)| system.as_deref() == Some(prompt::SYSTEM_PROMPT)));
        assert!(requests[0].1.contains("\"Content\": \"Julfa cemetery\""));
    }

    #[test]
    fn test_detect_stage_marks_failed_calls() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_revision_file(dir.path(), "Ani.jsonl", &[diff_record("+new line")]);

        let client = ScriptedClient::failing(LlmError::Timeout);
        let retry = no_retry();
        let artifact = DetectStage::new(&client, &retry).process(&input).unwrap();

        assert!(artifact_text(&artifact)
            .starts_with("Record 1 (Version: diff):\nError during API call: request timed out\n"));
        assert_eq!(artifact.summary.failed_calls, 1);
    }

    #[test]
    fn test_stance_stage_only_weaponised_rows() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("Ani_output.csv");
        std::fs::write(
            &input,
            "Source,Diff,Judgment\n\
             out/Ani_enriched_subsampled.jsonl,-a,Not Weaponised\n\
             out/Ani_enriched_subsampled.jsonl,-b,Weaponised\n\
             out/Ani_enriched_subsampled.jsonl,-c,weaponised\n",
        )
        .unwrap();

        let client = ScriptedClient::new(|_| Ok("Stance: Pro-Armenian".to_string()));
        let retry = no_retry();
        let stage = StanceStage::new(&client, &retry);

        assert_eq!(
            stage.output_path(Path::new("out"), &input),
            Path::new("out/Ani_finegrained_analysis.txt")
        );

        let artifact = stage.process(&input).unwrap();
        let text = artifact_text(&artifact);
        assert!(!text.contains("Record 1 "));
        assert!(text.starts_with("Record 2 (Version: N/A):\nStance: Pro-Armenian\n"));
        assert!(text.contains("Record 3 (Version: N/A):\n"));
        assert_eq!(artifact.summary.classified, 2);

        let requests = client.requests();
        assert!(requests[0].1.contains("\"Source\": \"Ani\""));
        assert!(requests[0].1.contains("\"Diff\": \"-b\""));
    }

    #[test]
    fn test_stance_stage_passes_every_column() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("Julfa_output.csv");
        std::fs::write(
            &input,
            "Source,version,Diff,Reviewer,Judgment\n\
             Julfa,diff,-khachkars,second pass,Weaponised\n\
             Julfa,,-cemetery,,Weaponised\n",
        )
        .unwrap();

        let client = ScriptedClient::new(|_| Ok("Anti-Armenian".to_string()));
        let retry = no_retry();
        let stage = StanceStage::new(&client, &retry);

        let artifact = stage.process(&input).unwrap();
        let text = artifact_text(&artifact);
        assert!(text.starts_with("Record 1 (Version: diff):\nAnti-Armenian\n"));
        assert!(text.contains("Record 2 (Version: N/A):\n"));

        let requests = client.requests();
        assert!(requests[0].1.contains(
            "{\n  \"Source\": \"Julfa\",\n  \"version\": \"diff\",\n  \"Diff\": \"-khachkars\",\n  \"Reviewer\": \"second pass\",\n  \"Judgment\": \"Weaponised\"\n}"
        ));
        assert!(requests[1].1.contains("\"Reviewer\": null"));
    }

    #[test]
    fn test_categorize_table() {
        let table = Table::read(Cursor::new(
            "topic,original_text\n1,first\n2,second\n3,third\n",
        ))
        .unwrap();

        let client = ScriptedClient::new(|prompt| {
            if prompt.contains("categorize: first") {
                Ok("\"Selective Omission\"".to_string())
            } else if prompt.contains("categorize: second") {
                Ok("  Tag Manipulation\n".to_string())
            } else {
                Ok("Something Else".to_string())
            }
        });
        let retry = no_retry();
        let classifier = Classifier::new(&client, &retry);

        for workers in 1..=3 {
            let labels = categorize_table(&table, 1, &classifier, &WorkerPool::new(workers));
            assert_eq!(
                labels,
                vec!["Selective Omission", "Tag Manipulation", "Something Else"]
            );
        }
    }

    #[test]
    fn test_categorize_file() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("topics.csv");
        let output = dir.path().join("topics_categorized.csv");
        std::fs::write(&input, "topic,original_text\n1,deleted the citation\n").unwrap();

        let client = ScriptedClient::new(|_| Ok("Citation Deletion".to_string()));
        let retry = no_retry();
        let classifier = Classifier::new(&client, &retry);
        let pool = WorkerPool::new(2);

        let rows = categorize_file(&input, &output, "original_text", &classifier, &pool).unwrap();
        assert_eq!(rows, 1);
        assert_eq!(
            std::fs::read_to_string(&output).unwrap(),
            "topic,original_text,weaponization_technique\n1,deleted the citation,Citation Deletion\n"
        );

        let err = categorize_file(&input, &output, "analysis", &classifier, &pool).unwrap_err();
        assert!(matches!(err, StageError::MissingColumn(column) if column == "analysis"));
    }
}
