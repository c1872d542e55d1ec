// Changeset Spec Builder (spec.md §4.7, C7). Renders a task's changeset
// templates against its final diff, then partitions that diff across
// `transformChanges.group` entries — grounded on the flat,
// `#[serde(rename_all)]`-style data modeling of
// `runner-worker/src/github_context.rs`, generalized here from a fixed
// GitHub Actions context to an output shape the Coordinator serializes for
// its caller.

use batchexec_common::errors::SpecificationError;
use batchexec_common::model::{AfterStepResult, BatchChangeAttrs, ImportChangeset, Task};
use batchexec_template::context::{
    BatchChangeContext, ChangesetTemplateContext, PreviousStepContext, RepositoryContext, StepSummary,
};
use batchexec_template::{parse_template, render};
use serde::Serialize;
use std::collections::HashMap;

/// One commit carried by a changeset spec (spec.md §6).
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Commit {
    pub message: String,
    pub author_name: String,
    pub author_email: String,
    /// Unified diff bytes, base64-encoded for transport.
    pub diff: String,
}

/// The externally-visible unit the Coordinator hands back to its caller
/// (spec.md §6). A spec produced for an `importChangesets` entry carries
/// `external_changeset` and omits `head_ref`/`body`/`commits`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ChangesetSpec {
    pub base_repository: String,
    pub base_ref: String,
    pub base_rev: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub head_ref: Option<String>,
    pub head_repository: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    pub published: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commits: Option<Vec<Commit>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_changeset: Option<ExternalChangeset>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ExternalChangeset {
    pub external_id: String,
}

fn render_field(location: &str, template_src: &str, ctx: &serde_json::Value) -> Result<String, SpecificationError> {
    let template = parse_template(template_src)
        .map_err(|e| SpecificationError::Template { location: location.to_string(), message: e.to_string() })?;
    render(&template, ctx).map_err(|e| SpecificationError::Template { location: location.to_string(), message: e.to_string() })
}

fn build_context(task: &Task, step_results: &[AfterStepResult]) -> ChangesetTemplateContext {
    let last = step_results.last();
    let outputs = last.map(|r| r.outputs.clone().into_iter().collect()).unwrap_or_default();
    let previous_step = last.map(|r| PreviousStepContext {
        modified_files: r.changed_files.modified.clone(),
        added_files: r.changed_files.added.clone(),
        deleted_files: r.changed_files.deleted.clone(),
        renamed_files: r.changed_files.renamed.clone(),
        stdout: r.stdout.clone(),
        stderr: r.stderr.clone(),
    });
    let steps = step_results
        .iter()
        .map(|r| StepSummary {
            path: task.path.clone(),
            modified_files: r.changed_files.modified.clone(),
            added_files: r.changed_files.added.clone(),
            deleted_files: r.changed_files.deleted.clone(),
            renamed_files: r.changed_files.renamed.clone(),
        })
        .collect();
    ChangesetTemplateContext {
        batch_change: BatchChangeContext { name: task.batch_change.name.clone(), description: task.batch_change.description.clone() },
        outputs,
        previous_step,
        steps,
        repository: RepositoryContext { name: task.repository.name.clone(), search_result_paths: vec![task.path.clone()] },
    }
}

/// Splits a unified diff produced by `git diff` into per-file chunks, keyed
/// by the file's path as it appears after `diff --git a/<path> b/<path>`.
fn split_diff_by_file(diff: &[u8]) -> Vec<(String, Vec<u8>)> {
    let text = String::from_utf8_lossy(diff);
    let mut out: Vec<(String, Vec<String>)> = Vec::new();

    for line in text.lines() {
        if let Some(path) = parse_diff_git_path(line) {
            out.push((path, vec![line.to_string()]));
        } else if let Some((_, lines)) = out.last_mut() {
            lines.push(line.to_string());
        }
    }

    out.into_iter().map(|(path, lines)| (path, format!("{}\n", lines.join("\n")).into_bytes())).collect()
}

fn parse_diff_git_path(line: &str) -> Option<String> {
    let rest = line.strip_prefix("diff --git ")?;
    let b_idx = rest.find(" b/")?;
    rest[..b_idx].strip_prefix("a/").map(|s| s.to_string())
}

fn path_in_directory(path: &str, directory: &str) -> bool {
    path == directory || path.starts_with(&format!("{directory}/"))
}

/// Builds the changeset spec(s) for one executed task. Returns an empty
/// vec when the final diff is empty (spec.md §4.7: "an empty final diff
/// produces zero specs").
pub fn build_changeset_specs(task: &Task, step_results: &[AfterStepResult]) -> Result<Vec<ChangesetSpec>, SpecificationError> {
    let Some(last) = step_results.last() else {
        return Ok(vec![]);
    };
    if last.is_empty_diff() {
        return Ok(vec![]);
    }

    let ctx = build_context(task, step_results).to_json();
    let tpl = &task.changeset_template;
    let title = render_field("changeset_template.title", &tpl.title, &ctx)?;
    let body = render_field("changeset_template.body", &tpl.body, &ctx)?;
    let default_branch = render_field("changeset_template.branch", &tpl.branch, &ctx)?;
    let commit_message = render_field("changeset_template.commit_message", &tpl.commit_message, &ctx)?;
    let author_name = render_field("changeset_template.author.name", &tpl.author.name, &ctx)?;
    let author_email = render_field("changeset_template.author.email", &tpl.author.email, &ctx)?;
    let published = render_field("changeset_template.published", &tpl.published, &ctx)?;

    let make_spec = |branch: String, diff: Vec<u8>| -> ChangesetSpec {
        ChangesetSpec {
            base_repository: task.repository.name.clone(),
            base_ref: task.repository.default_branch.clone(),
            base_rev: task.repository.commit.clone(),
            head_ref: Some(branch),
            head_repository: task.repository.name.clone(),
            title: title.clone(),
            body: Some(body.clone()),
            published: published.clone(),
            commits: Some(vec![Commit {
                message: commit_message.clone(),
                author_name: author_name.clone(),
                author_email: author_email.clone(),
                diff: base64_encode(&diff),
            }]),
            external_changeset: None,
        }
    };

    if task.transform_changes.group.is_empty() {
        return Ok(vec![make_spec(default_branch, last.diff.clone())]);
    }

    for group in &task.transform_changes.group {
        if group.branch == default_branch {
            return Err(SpecificationError::GroupBranchCollidesWithDefault { branch: group.branch.clone() });
        }
    }

    let mut sorted_groups: Vec<_> = task.transform_changes.group.iter().collect();
    sorted_groups.sort_by_key(|g| std::cmp::Reverse(g.directory.len()));

    let mut grouped: HashMap<String, Vec<u8>> = HashMap::new();
    let mut default_diff: Vec<u8> = Vec::new();

    for (path, chunk) in split_diff_by_file(&last.diff) {
        let matched = sorted_groups
            .iter()
            .find(|g| path_in_directory(&path, &g.directory) && g.repository.as_deref().map_or(true, |r| r == task.repository.name));
        match matched {
            Some(group) => grouped.entry(group.branch.clone()).or_default().extend_from_slice(&chunk),
            None => default_diff.extend_from_slice(&chunk),
        }
    }

    let mut specs = Vec::new();
    if !default_diff.is_empty() {
        specs.push(make_spec(default_branch, default_diff));
    }
    let mut branches: Vec<_> = grouped.into_iter().collect();
    branches.sort_by(|a, b| a.0.cmp(&b.0));
    for (branch, diff) in branches {
        specs.push(make_spec(branch, diff));
    }
    Ok(specs)
}

/// Synthesizes one spec per external ID of an `importChangesets` entry —
/// no steps run, no diff is produced (spec.md §6).
pub fn import_changeset_specs(_batch_change: &BatchChangeAttrs, imported: &ImportChangeset) -> Vec<ChangesetSpec> {
    imported
        .external_ids
        .iter()
        .map(|external_id| ChangesetSpec {
            base_repository: imported.repository.clone(),
            base_ref: String::new(),
            base_rev: String::new(),
            head_ref: None,
            head_repository: imported.repository.clone(),
            title: String::new(),
            body: None,
            published: String::new(),
            commits: None,
            external_changeset: Some(ExternalChangeset { external_id: external_id.clone() }),
        })
        .collect()
}

/// Rejects a batch of specs containing two distinct specs with the same
/// `(base_repository, head_ref)` (spec.md §4.7, §8 "Branch uniqueness").
pub fn validate_no_duplicate_head_refs(specs: &[ChangesetSpec]) -> Result<(), SpecificationError> {
    let mut seen: HashMap<(String, String), Vec<String>> = HashMap::new();
    for spec in specs {
        if let Some(head_ref) = &spec.head_ref {
            seen.entry((spec.base_repository.clone(), head_ref.clone())).or_default().push(spec.title.clone());
        }
    }
    for ((base_repo, head_ref), offenders) in seen {
        if offenders.len() > 1 {
            return Err(SpecificationError::DuplicateHeadRef { base_repo, head_ref, offenders });
        }
    }
    Ok(())
}

fn base64_encode(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}
