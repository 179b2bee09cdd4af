//! PASS/FAIL extraction from review reports.
//!
//! Parsing is strict and default-deny: only an exact `VERDICT: PASS` line
//! near the end of the report counts as a pass.

use std::fmt;

const PASS_LINE: &str = "VERDICT: PASS";
const FAIL_LINE: &str = "VERDICT: FAIL";

/// How many trailing non-empty lines are searched for a verdict.
const VERDICT_WINDOW: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Fail,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pass => f.write_str("PASS"),
            Self::Fail => f.write_str("FAIL"),
        }
    }
}

pub fn parse_verdict(text: &str) -> Verdict {
    text.lines()
        .rev()
        .filter(|line| !line.trim().is_empty())
        .take(VERDICT_WINDOW)
        .find_map(|line| match line {
            PASS_LINE => Some(Verdict::Pass),
            FAIL_LINE => Some(Verdict::Fail),
            _ => None,
        })
        .unwrap_or(Verdict::Fail)
}

/// A review cut off by the token ceiling never reached a judgment; pin it
/// to FAIL.
pub fn force_fail(text: &str) -> String {
    format!("{text}\n\n{FAIL_LINE}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Done,
    Failed(String),
}

/// Both reviews must pass for the job to be done.
pub fn resolve(security: Verdict, code: Verdict) -> Resolution {
    let failing = match (security, code) {
        (Verdict::Pass, Verdict::Pass) => return Resolution::Done,
        (Verdict::Fail, Verdict::Pass) => "the security review",
        (Verdict::Pass, Verdict::Fail) => "the code review",
        (Verdict::Fail, Verdict::Fail) => "the security review and the code review",
    };
    Resolution::Failed(format!(
        "Review did not pass: {failing} returned FAIL. Read the review report, then retry to resume from the last checkpoint."
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_pass_line_passes() {
        assert_eq!(parse_verdict("Looks good.\n\nVERDICT: PASS"), Verdict::Pass);
        assert_eq!(parse_verdict("Looks good.\r\nVERDICT: PASS\r\n"), Verdict::Pass);
    }

    #[test]
    fn test_default_deny_on_missing_or_malformed_verdict() {
        assert_eq!(parse_verdict(""), Verdict::Fail);
        assert_eq!(parse_verdict("All fine"), Verdict::Fail);
        assert_eq!(parse_verdict("VERDICT: pass"), Verdict::Fail);
        assert_eq!(parse_verdict("Verdict: PASS"), Verdict::Fail);
        assert_eq!(parse_verdict("VERDICT: PASS."), Verdict::Fail);
        assert_eq!(parse_verdict("  VERDICT: PASS"), Verdict::Fail);
        assert_eq!(parse_verdict("**VERDICT: PASS**"), Verdict::Fail);
    }

    #[test]
    fn test_verdict_outside_trailing_window_is_ignored() {
        let text = "VERDICT: PASS\none\ntwo\nthree\nfour\nfive\n";
        assert_eq!(parse_verdict(text), Verdict::Fail);
        let text = "VERDICT: PASS\none\n\n\ntwo\nthree\nfour\n\n";
        assert_eq!(parse_verdict(text), Verdict::Pass);
    }

    #[test]
    fn test_last_verdict_line_wins() {
        assert_eq!(parse_verdict("VERDICT: PASS\nVERDICT: FAIL"), Verdict::Fail);
        assert_eq!(parse_verdict("VERDICT: FAIL\nVERDICT: PASS"), Verdict::Pass);
    }

    #[test]
    fn test_forced_fail_overrides_earlier_pass() {
        let truncated = "Partial review...\nVERDICT: PASS";
        assert_eq!(parse_verdict(&force_fail(truncated)), Verdict::Fail);
    }

    #[test]
    fn test_both_reviews_must_pass() {
        assert_eq!(resolve(Verdict::Pass, Verdict::Pass), Resolution::Done);

        let Resolution::Failed(msg) = resolve(Verdict::Fail, Verdict::Pass) else {
            panic!("expected failure");
        };
        assert!(msg.contains("security review"));
        assert!(!msg.contains("code review"));

        let Resolution::Failed(msg) = resolve(Verdict::Pass, Verdict::Fail) else {
            panic!("expected failure");
        };
        assert!(msg.contains("code review"));
        assert!(!msg.contains("security review"));

        let Resolution::Failed(msg) = resolve(Verdict::Fail, Verdict::Fail) else {
            panic!("expected failure");
        };
        assert!(msg.contains("security review") && msg.contains("code review"));
    }
}
