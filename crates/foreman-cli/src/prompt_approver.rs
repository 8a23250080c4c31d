//! Interactive approvals on the controlling terminal.

use anyhow::Result;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::warn;

use foreman_core::PendingApproval;

/// Answer pending approvals from `reader`, prompting on `writer`, until the
/// channel closes. `y` or `yes` approves; anything else rejects with the
/// typed text as the reason. End of input rejects what is still pending.
pub async fn serve<R, W>(
    mut pending: mpsc::Receiver<PendingApproval>,
    mut reader: R,
    mut writer: W,
    approver: &str,
) -> Result<usize>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut answered = 0;
    while let Some(approval) = pending.recv().await {
        let action = approval.request.action.clone();
        writer.write_all(prompt(&approval).as_bytes()).await?;
        writer.flush().await?;

        let mut line = String::new();
        let read = reader.read_line(&mut line).await?;
        let answer = line.trim();
        let delivered = if read == 0 {
            approval.reject(approver, "no answer (input closed)")
        } else if matches!(answer.to_ascii_lowercase().as_str(), "y" | "yes") {
            approval.approve(approver)
        } else if answer.is_empty() || answer.eq_ignore_ascii_case("n") || answer.eq_ignore_ascii_case("no") {
            approval.reject(approver, "declined at prompt")
        } else {
            approval.reject(approver, answer)
        };

        if delivered {
            answered += 1;
        } else {
            warn!(action = %action, "decision arrived after the approval timed out");
            writer.write_all(b"  too late: request already timed out\n").await?;
        }
    }
    Ok(answered)
}

fn prompt(approval: &PendingApproval) -> String {
    let request = &approval.request;
    let resources = if request.resources.is_empty() {
        "-".to_string()
    } else {
        request.resources.join(", ")
    };
    format!(
        "\n[{}] {}\n  resources: {}\n  decide within {}s. approve? [y/N] ",
        request.risk_level, request.action, resources, request.timeout_seconds,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_core::{ApprovalOutcome, ApprovalRequest, Approver, ChannelApprover, RiskLevel};

    fn request() -> ApprovalRequest {
        ApprovalRequest::new("drop table users", vec!["db/users".into()], RiskLevel::High, 30)
    }

    #[tokio::test]
    async fn test_yes_approves_and_prompt_mentions_action() {
        let (approver, rx) = ChannelApprover::new(1);
        let mut out = Vec::new();
        let serving = serve(rx, &b"yes\n"[..], &mut out, "dana");
        let deciding = async move {
            let decision = approver.decide(&request()).await.unwrap();
            drop(approver);
            decision
        };
        let (served, decision) = tokio::join!(serving, deciding);

        assert_eq!(served.unwrap(), 1);
        assert_eq!(decision.outcome, ApprovalOutcome::Approved);
        assert_eq!(decision.approver, "dana");
        let prompt = String::from_utf8(out).unwrap();
        assert!(prompt.contains("[HIGH] drop table users"));
        assert!(prompt.contains("db/users"));
    }

    #[tokio::test]
    async fn test_free_text_rejects_with_reason() {
        let (approver, rx) = ChannelApprover::new(1);
        let mut out = Vec::new();
        let serving = serve(rx, &b"not during the freeze\n"[..], &mut out, "dana");
        let deciding = async move {
            let decision = approver.decide(&request()).await.unwrap();
            drop(approver);
            decision
        };
        let (_, decision) = tokio::join!(serving, deciding);

        assert_eq!(decision.outcome, ApprovalOutcome::Rejected);
        assert_eq!(decision.reason.as_deref(), Some("not during the freeze"));
    }

    #[tokio::test]
    async fn test_closed_input_rejects() {
        let (approver, rx) = ChannelApprover::new(1);
        let serving = serve(rx, &b""[..], tokio::io::sink(), "dana");
        let deciding = async move {
            let decision = approver.decide(&request()).await.unwrap();
            drop(approver);
            decision
        };
        let (_, decision) = tokio::join!(serving, deciding);
        assert_eq!(decision.outcome, ApprovalOutcome::Rejected);
    }
}
