//! Kernel log fault classification.
//!
//! # Responsibilities
//! - Turn free-form log lines into typed fault events
//! - Keep unrecognized error-flavored lines as `Unknown` instead of dropping them
//! - Recognize the driver declining to recover as confirmation, not a new event
//!
//! # Design Decisions
//! - Ordered rule table; first match wins, configured rules before built-ins
//! - Case-insensitive substring matching, so format drift in prefixes and
//!   spacing does not break classification
//! - AER header lines are context: the detail line that follows names the error
//! - Stateless: the caller owns the log cursor

use serde::{Deserialize, Serialize};

use crate::config::schema::ClassifierConfig;
use crate::health::FaultKind;

/// What a matching rule does with a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    /// The line reports a fault of this kind.
    Emit(FaultKind),
    /// The driver gave up; an earlier completion timeout is now terminal.
    ConfirmTerminal,
    /// Part of a multi-line report; carries no event of its own.
    Context,
}

/// A configured classification rule.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RuleConfig {
    /// Every string must appear in the line (case-insensitive).
    pub contains: Vec<String>,

    /// Fault emitted on match. When absent the line is treated as context.
    #[serde(default)]
    pub kind: Option<FaultKind>,

    /// Match confirms a terminal fault instead of emitting one.
    #[serde(default)]
    pub terminal: bool,
}

#[derive(Debug, Clone)]
struct Rule {
    all_of: Vec<String>,
    // When set, the line must also mention a watched tag.
    needs_tag: bool,
    action: RuleAction,
}

impl Rule {
    fn new(all_of: &[&str], needs_tag: bool, action: RuleAction) -> Self {
        Self {
            all_of: all_of.iter().map(|s| s.to_lowercase()).collect(),
            needs_tag,
            action,
        }
    }
}

/// Result of classifying one batch of log lines.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classification {
    /// Fault events in log order.
    pub faults: Vec<FaultKind>,
    /// The driver reported it cannot recover from the last fault.
    pub terminal_confirmed: bool,
}

/// Pattern-table classifier for kernel log lines.
#[derive(Debug, Clone)]
pub struct FaultClassifier {
    rules: Vec<Rule>,
    watch_tags: Vec<String>,
}

const ERROR_WORDS: &[&str] = &["error", "fail", "fault", "timeout", "timed out"];

impl FaultClassifier {
    pub fn new(config: &ClassifierConfig) -> Self {
        let mut rules: Vec<Rule> = config
            .rules
            .iter()
            .map(|rule| Rule {
                all_of: rule
                    .contains
                    .iter()
                    .filter(|s| !s.trim().is_empty())
                    .map(|s| s.to_lowercase())
                    .collect(),
                needs_tag: false,
                action: match (rule.terminal, rule.kind) {
                    (true, _) => RuleAction::ConfirmTerminal,
                    (false, Some(kind)) => RuleAction::Emit(kind),
                    (false, None) => RuleAction::Context,
                },
            })
            .collect();
        rules.extend(builtin_rules());

        Self {
            rules,
            watch_tags: config.watch_tags.iter().map(|t| t.to_lowercase()).collect(),
        }
    }

    /// Watch an extra tag (typically the driver name).
    pub fn with_tag(mut self, tag: &str) -> Self {
        let tag = tag.to_lowercase();
        if !self.watch_tags.contains(&tag) {
            self.watch_tags.push(tag);
        }
        self
    }

    /// Classify one line. `None` means unrelated noise.
    pub fn classify_line(&self, line: &str) -> Option<RuleAction> {
        let lower = line.to_lowercase();
        let tagged = self.watch_tags.iter().any(|t| lower.contains(t.as_str()));

        for rule in &self.rules {
            if rule.needs_tag && !tagged {
                continue;
            }
            if rule.all_of.iter().all(|needle| lower.contains(needle.as_str())) {
                return Some(rule.action);
            }
        }

        if tagged && ERROR_WORDS.iter().any(|w| lower.contains(w)) {
            return Some(RuleAction::Emit(FaultKind::Unknown));
        }
        None
    }

    /// Classify a batch of lines in order.
    pub fn classify<S: AsRef<str>>(&self, lines: &[S]) -> Classification {
        let mut result = Classification::default();
        for line in lines {
            match self.classify_line(line.as_ref()) {
                Some(RuleAction::Emit(kind)) => result.faults.push(kind),
                Some(RuleAction::ConfirmTerminal) => result.terminal_confirmed = true,
                Some(RuleAction::Context) | None => {}
            }
        }
        result
    }
}

fn builtin_rules() -> Vec<Rule> {
    use RuleAction::*;
    vec![
        Rule::new(&["cmpltto"], false, Emit(FaultKind::CompletionTimeout)),
        Rule::new(&["completion timeout"], false, Emit(FaultKind::CompletionTimeout)),
        Rule::new(&["unsupreq"], false, Emit(FaultKind::UnsupportedRequest)),
        Rule::new(&["unsupported request"], false, Emit(FaultKind::UnsupportedRequest)),
        Rule::new(&["malftlp"], false, Emit(FaultKind::MalformedTlp)),
        Rule::new(&["malformed tlp"], false, Emit(FaultKind::MalformedTlp)),
        Rule::new(&["can't recover", "error_detected"], false, ConfirmTerminal),
        Rule::new(&["surprise down"], true, Emit(FaultKind::DeviceGone)),
        Rule::new(&["card not present"], true, Emit(FaultKind::DeviceGone)),
        Rule::new(&["device removed"], true, Emit(FaultKind::DeviceGone)),
        Rule::new(&["link down"], true, Emit(FaultKind::DeviceGone)),
        Rule::new(&["pcie bus error"], false, Context),
        Rule::new(&["error status/mask"], false, Context),
        Rule::new(&["aer:", "error received"], false, Context),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> FaultClassifier {
        FaultClassifier::new(&ClassifierConfig::default())
    }

    #[test]
    fn test_multiline_aer_report_yields_one_completion_timeout() {
        let lines = [
            "[ 200.500000] pcieport 0004:00:00.0: AER: Uncorrected (Non-Fatal) error received: 0004:01:00.0",
            "[ 200.500010] ath12k_pci 0004:01:00.0: PCIe Bus Error: severity=Uncorrected (Non-Fatal), type=Transaction Layer, (Requester ID)",
            "[ 200.500020] ath12k_pci 0004:01:00.0:   device [17cb:1107] error status/mask=00004000/00400000",
            "[ 200.500030] ath12k_pci 0004:01:00.0:    [14] CmpltTO                (First)",
        ];
        let result = classifier().classify(&lines);
        assert_eq!(result.faults, vec![FaultKind::CompletionTimeout]);
        assert!(!result.terminal_confirmed);
    }

    #[test]
    fn test_terminal_confirmation_is_not_an_event() {
        let lines = [
            "ath12k_pci 0004:01:00.0:    [14] CmpltTO                (First)",
            "pcieport 0004:00:00.0: AER: device recovery failed",
            "ath12k_pci 0004:01:00.0: AER: can't recover (no error_detected callback)",
        ];
        let result = classifier().classify(&lines);
        assert!(result.terminal_confirmed);
        // The "recovery failed" line is error-flavored and tagged: kept as Unknown.
        assert_eq!(
            result.faults,
            vec![FaultKind::CompletionTimeout, FaultKind::Unknown]
        );
    }

    #[test]
    fn test_unsupported_and_malformed() {
        let lines = [
            "ath12k_pci 0004:01:00.0:    [20] UnsupReq               (First)",
            "ath12k_pci 0004:01:00.0:    [18] MalfTLP                (First)",
        ];
        let result = classifier().classify(&lines);
        assert_eq!(
            result.faults,
            vec![FaultKind::UnsupportedRequest, FaultKind::MalformedTlp]
        );
    }

    #[test]
    fn test_device_gone_needs_bus_tag() {
        let c = classifier();
        assert_eq!(
            c.classify_line("pcieport 0004:00:00.0: pciehp: Slot(0): Card not present"),
            Some(RuleAction::Emit(FaultKind::DeviceGone))
        );
        assert_eq!(c.classify_line("usb 1-1: card not present"), None);
    }

    #[test]
    fn test_noise_is_ignored() {
        let lines = [
            "wlp1s0: authenticated",
            "usb 3-2: new high-speed USB device number 4 using xhci_hcd",
            "ath12k_pci 0004:01:00.0: fw_version 0x1012",
        ];
        assert_eq!(classifier().classify(&lines), Classification::default());
    }

    #[test]
    fn test_configured_rules_take_precedence() {
        let mut config = ClassifierConfig::default();
        config.rules.push(RuleConfig {
            contains: vec!["mhi".into(), "sys_err".into()],
            kind: Some(FaultKind::CompletionTimeout),
            terminal: false,
        });
        config.rules.push(RuleConfig {
            contains: vec!["ath12k".into(), "timeout waiting".into()],
            kind: None,
            terminal: false,
        });
        let c = FaultClassifier::new(&config);

        assert_eq!(
            c.classify_line("mhi mhi0: Device MHI is not in valid state, SYS_ERR"),
            Some(RuleAction::Emit(FaultKind::CompletionTimeout))
        );
        // Would be Unknown without the context rule.
        assert_eq!(
            c.classify_line("ath12k_pci 0004:01:00.0: timeout waiting for firmware"),
            Some(RuleAction::Context)
        );
    }

    #[test]
    fn test_extra_tag() {
        let c = classifier().with_tag("simdev");
        assert_eq!(
            c.classify_line("simdev 0000:01:00.0: register read failed"),
            Some(RuleAction::Emit(FaultKind::Unknown))
        );
    }
}
