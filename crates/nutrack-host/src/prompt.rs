//! Terminal prompt for sync conflicts.

use nutrack_bridge::{ConflictCallbacks, ConflictResolution, DecisionSurface};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;

/// Asks on stderr and reads the answer from stdin.
pub struct TerminalSurface;

/// Map a typed answer to a resolution; anything unrecognized cancels.
pub fn parse_answer(answer: &str) -> ConflictResolution {
    match answer.trim().to_ascii_lowercase().as_str() {
        "l" | "local" | "keep-local" => ConflictResolution::KeepLocal,
        "r" | "remote" | "take-remote" => ConflictResolution::TakeRemote,
        _ => ConflictResolution::Cancel,
    }
}

#[async_trait::async_trait]
impl DecisionSurface for TerminalSurface {
    async fn decide(&self, _callbacks: &ConflictCallbacks) -> ConflictResolution {
        eprintln!();
        eprintln!("The local database and the Dropbox copy have diverged.");
        eprintln!("  [l] keep local  (upload this database to Dropbox)");
        eprintln!("  [r] take remote (replace this database with the Dropbox copy)");
        eprintln!("  [anything else] cancel");
        eprint!("> ");

        let mut line = String::new();
        let mut stdin = BufReader::new(tokio::io::stdin());
        match stdin.read_line(&mut line).await {
            Ok(0) => ConflictResolution::Cancel,
            Ok(_) => parse_answer(&line),
            Err(e) => {
                warn!("Failed to read conflict answer: {}", e);
                ConflictResolution::Cancel
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_answer() {
        assert_eq!(parse_answer("l\n"), ConflictResolution::KeepLocal);
        assert_eq!(parse_answer(" Remote "), ConflictResolution::TakeRemote);
        assert_eq!(parse_answer(""), ConflictResolution::Cancel);
        assert_eq!(parse_answer("x"), ConflictResolution::Cancel);
    }
}
