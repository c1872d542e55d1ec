// Workspace variant selection policy (spec.md §4.2): on Linux prefer
// named-volume; elsewhere, bind-mount unless every step image reports the
// same effective UID. Probing shells to `docker run --rm <image> id -u`
// via the same `ProcessInvoker` idiom as `docker_command_manager.rs`.

use batchexec_common::constants::OsPlatform;
use batchexec_sdk::process_invoker::ProcessInvoker;
use batchexec_sdk::trace::NullTraceWriter;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkspaceVariant {
    BindMount,
    NamedVolume,
}

/// Decide which workspace variant to use for a task whose steps run the
/// given `step_images`, on `platform`.
pub async fn select_variant(platform: OsPlatform, step_images: &[String]) -> WorkspaceVariant {
    if platform.is_linux() {
        return WorkspaceVariant::NamedVolume;
    }

    let mut uids = Vec::with_capacity(step_images.len());
    for image in step_images {
        match probe_effective_uid(image).await {
            Some(uid) => uids.push(uid),
            // "if any image's identity cannot be determined, fall back to bind."
            None => return WorkspaceVariant::BindMount,
        }
    }

    let all_same = uids.windows(2).all(|w| w[0] == w[1]);
    if all_same {
        WorkspaceVariant::NamedVolume
    } else {
        WorkspaceVariant::BindMount
    }
}

async fn probe_effective_uid(image: &str) -> Option<u32> {
    let mut invoker = ProcessInvoker::new(Arc::new(NullTraceWriter));
    let mut stdout_rx = invoker.take_stdout_receiver()?;
    let output_handle = tokio::spawn(async move {
        let mut lines = Vec::new();
        while let Some(event) = stdout_rx.recv().await {
            lines.push(event.data);
        }
        lines.join("\n")
    });

    let args = format!("run --rm --entrypoint id {image} -u");
    let exit_code = invoker
        .execute("", "docker", &args, None, false, false, CancellationToken::new())
        .await
        .ok()?;
    let output = output_handle.await.unwrap_or_default();
    if exit_code != 0 {
        return None;
    }
    output.trim().parse::<u32>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn linux_always_prefers_named_volume() {
        let v = select_variant(OsPlatform::Linux, &["anything:latest".to_string()]).await;
        assert_eq!(v, WorkspaceVariant::NamedVolume);
    }
}
