// 🎫 Ticket Rules - Support ticket triage
// Priority from free-text signals, missing-field follow-ups, duplicate ids.

use std::collections::HashMap;

use super::{display_id, FollowUpQuestion, Issue, Severity};
use crate::loader::TicketRow;

pub const DUPLICATE_TICKET: &str = "DUPLICATE_TICKET";
pub const MISSING_INFO: &str = "MISSING_INFO";
pub const HIGH_PRIORITY: &str = "HIGH_PRIORITY";

/// Amount above which a ticket earns one extra priority point.
pub const AMOUNT_THRESHOLD: f64 = 1000.0;

/// (keywords, points). Each family counts once, however many words match.
const KEYWORD_FAMILIES: &[(&[&str], u32)] = &[
    (&["iade", "refund", "return"], 2),
    (&["acil", "urgent", "hemen"], 2),
    (&["para", "payment", "charge"], 1),
];

// ============================================================================
// PRIORITY
// ============================================================================

/// Score and bucket: >= 4 high, >= 2 medium, otherwise low.
pub fn priority_score(text: &str, amount: Option<f64>) -> (u32, Severity) {
    let lowered = text.to_lowercase();
    let mut score: u32 = KEYWORD_FAMILIES
        .iter()
        .filter(|(words, _)| words.iter().any(|w| lowered.contains(w)))
        .map(|(_, points)| points)
        .sum();

    if amount.is_some_and(|a| a > AMOUNT_THRESHOLD) {
        score += 1;
    }

    let severity = match score {
        s if s >= 4 => Severity::High,
        s if s >= 2 => Severity::Medium,
        _ => Severity::Low,
    };
    (score, severity)
}

/// Per-bucket counts plus the ids of high-priority tickets.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PrioritySummary {
    pub high: usize,
    pub medium: usize,
    pub low: usize,
    pub high_priority_ids: Vec<String>,
}

impl PrioritySummary {
    pub fn decision(&self) -> String {
        format!("High={} Medium={} Low={}", self.high, self.medium, self.low)
    }
}

pub fn score_priorities(tickets: &[TicketRow]) -> (PrioritySummary, Vec<Issue>) {
    let mut summary = PrioritySummary::default();
    let mut issues = Vec::new();

    for ticket in tickets {
        let (score, severity) = priority_score(&ticket.customer_text, ticket.amount);
        match severity {
            Severity::High => {
                summary.high += 1;
                summary.high_priority_ids.push(ticket.ticket_id.clone());
                issues.push(Issue::new(
                    format!("priority-{}", ticket.ticket_id),
                    &ticket.ticket_id,
                    Severity::High,
                    HIGH_PRIORITY,
                    format!("Priority score {} on ticket {}", score, ticket.ticket_id),
                ));
            }
            Severity::Medium => summary.medium += 1,
            _ => summary.low += 1,
        }
    }

    (summary, issues)
}

// ============================================================================
// MISSING INFORMATION
// ============================================================================

/// Fields a ticket lacks: order reference and/or numeric amount.
pub fn missing_fields(ticket: &TicketRow) -> Vec<&'static str> {
    let mut missing = Vec::new();
    if ticket.order_id.as_deref().map_or(true, |o| o.trim().is_empty()) {
        missing.push("order_id");
    }
    if ticket.amount.is_none() {
        missing.push("amount");
    }
    missing
}

/// One follow-up question (and one issue) per ticket with missing fields.
pub fn find_missing_info(tickets: &[TicketRow]) -> (Vec<Issue>, Vec<FollowUpQuestion>) {
    let mut issues = Vec::new();
    let mut questions = Vec::new();

    for ticket in tickets {
        let missing = missing_fields(ticket);
        if missing.is_empty() {
            continue;
        }
        let subject_id = if ticket.ticket_id.is_empty() {
            "unknown".to_string()
        } else {
            ticket.ticket_id.clone()
        };

        issues.push(Issue::new(
            format!("missing-{}", subject_id),
            &subject_id,
            Severity::Medium,
            MISSING_INFO,
            format!("ticket_id={} missing={}", subject_id, missing.join(",")),
        ));
        questions.push(FollowUpQuestion {
            subject_id,
            missing: missing.iter().map(|m| m.to_string()).collect(),
            question: format!("Please share the missing details: {}", missing.join(", ")),
        });
    }

    (issues, questions)
}

// ============================================================================
// DUPLICATES
// ============================================================================

pub fn find_duplicate_tickets(tickets: &[TicketRow]) -> Vec<Issue> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    let mut order = Vec::new();
    for ticket in tickets {
        let count = counts.entry(ticket.ticket_id.as_str()).or_insert(0);
        if *count == 0 {
            order.push(ticket.ticket_id.as_str());
        }
        *count += 1;
    }

    order
        .into_iter()
        .filter(|id| counts.get(id).copied().unwrap_or(0) > 1)
        .map(|id| {
            let id = display_id(id);
            Issue::new(
                format!("dup-{}", id),
                id.as_str(),
                Severity::High,
                DUPLICATE_TICKET,
                format!("Duplicate ticket_id detected: {}", id),
            )
        })
        .collect()
}

// ============================================================================
// TESTS
// ============================================================================
