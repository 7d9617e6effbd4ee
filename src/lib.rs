// SPDX-License-Identifier: MPL-2.0
//! # wikiwatch
//!
//! Batch tooling for finding biased rewording of contested historical and cultural narratives in
//! Wikipedia revision histories.
//!
//! ## Overview
//!
//! `wikiwatch` works on per-article revision files (one JSON object per line, the first line being
//! the initial article text and every following line one edit as a unified diff). It runs a small
//! pipeline over whole directories of such files:
//!
//! - **Enrich**: decompose every diff into outright added/removed lines and the words that changed
//!   inside edited lines.
//! - **Detect**: ask a language model whether each revision weaponises the narrative.
//! - **Stance**: for revisions already judged weaponised, ask which side they favour.
//! - **Categorize**: label earlier analyses with one technique from a closed vocabulary.
//!
//! **Key Features:**
//!
//! - **Parallel Processing**: files are processed on a fixed pool of worker threads, the model is
//!   a blocking call that only blocks its own worker.
//! - **Failure Isolation**: a malformed file fails on its own, a failed model call becomes an inline
//!   marker in the report instead of aborting the batch.
//! - **Deterministic Decomposition**: the diff decomposition is pure and independent of the model.
//!
//! ## Getting Started
//!
//! ### Decomposing a diff
//!
//! ```rust
//! use wikiwatch::unidiff::decompose;
//!
//! let decomposition = decompose("@@ -1 +1 @@\n-the cat sat\n+the dog sat\n+a new line");
//!
//! assert_eq!(decomposition.removed_words, ["cat"]);
//! assert_eq!(decomposition.added_words, ["dog"]);
//! assert_eq!(decomposition.added_lines, ["a new line"]);
//! assert!(decomposition.removed_lines.is_empty());
//! ```
//!
//! ### Running a stage over a directory
//!
//! ```no_run
//! use wikiwatch::batch::{run_batch, BatchConfig};
//! use wikiwatch::classifier::{ClientConfig, OpenAiClient, RetryPolicy};
//! use wikiwatch::pipeline::DetectStage;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = OpenAiClient::new(&ClientConfig::new("sk-..."))?;
//!     let retry = RetryPolicy::default();
//!     let stage = DetectStage::new(&client, &retry);
//!
//!     let config = BatchConfig {
//!         input_dir: "revisions".into(),
//!         extension: "jsonl".into(),
//!         output_dir: "analysis".into(),
//!         workers: 4,
//!     };
//!     let report = run_batch(&config, &stage)?;
//!     for failure in &report.failures {
//!         eprintln!("{}: {}", failure.input.display(), failure.error);
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Modules and API
//!
//! ### `unidiff` Module
//!
//! **Purpose**: Decomposes a unified diff into line- and word-level changes.
//!
//! A removal line that is directly followed by an addition line is treated as one edited line,
//! and only the words that differ between the two are reported. Other additions and removals are
//! reported as whole lines.
//!
//! ### `record` Module
//!
//! **Purpose**: Reads and writes revision records (JSON lines) and judged revisions (CSV).
//!
//! ### `classifier` Module
//!
//! **Purpose**: The chat-completion client, the retry policy and the inline error marker.
//!
//! ### `prompt` Module
//!
//! **Purpose**: The instruction templates and the closed label vocabularies.
//!
//! ### `batch` and `pipeline` Modules
//!
//! **Purpose**: The worker pool, the directory runner and the four stages.
//!
//! ## Data Structures
//!
//! - **`RevisionRecord`**: either the first version of an article or one diff, selected by the
//!   `version` key. Unknown keys are carried through unchanged.
//! - **`DiffDecomposition`**: `Added_Lines`, `Removed_Lines`, `Added_Words`, `Removed_Words`.
//! - **`JudgedRevision`**: one row of a CSV export with an earlier `Judgment`.
//!
//! ## Configuration
//!
//! With the `strict` feature enabled a diff record without a `Diff` field fails the whole file
//! instead of being treated as an empty diff.
//!
//! ## License
//!
//! This project is licensed under the Mozilla Public License 2.0.

pub mod batch;
pub mod classifier;
pub mod pipeline;
pub mod prompt;
pub mod record;
#[cfg(test)]
mod test_support;
pub mod unidiff;
