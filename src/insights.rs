//! Inbox-level insights derived from classified email.
//!
//! [`analyze_progress`] and [`suggest_follow_ups`] are pure functions of the
//! classified set and a clock. The narrative inbox summary is a single
//! model call on [`ClassificationChain`].

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use crate::classify::ClassificationChain;
use crate::clean::{company_from_address, parse_sender};
use crate::inference::{GenerateOptions, Generation};
use crate::models::{
    Category, ClassifiedEmail, FollowUp, FollowUpKind, Priority, ProgressMetrics, ProgressReport,
};

/// Most recent summaries included in the inbox summary prompt.
pub const MAX_SUMMARY_EMAILS: usize = 20;
pub const MAX_FOLLOW_UPS: usize = 10;
const MAX_COMPANIES: usize = 10;

const APPLICATION_FOLLOW_UP_DAYS: i64 = 7;
const INTERVIEW_THANK_YOU_DAYS: i64 = 2;
const RECRUITER_REPLY_DAYS: i64 = 2;

const SUMMARY_PROMPT: &str = "You are a career advisor analyzing a user's job search email activity.
Create a comprehensive but concise weekly progress report.

Email Activity Summary:
{email_summaries}

Pipeline Statistics:
{pipeline_stats}

Please provide a structured summary covering:
1. Overall Progress: High-level assessment of job search activity
2. Key Highlights: Important developments (interviews, offers, etc.)
3. Action Items: What the user should focus on next
4. Pipeline Health: Assessment of application-to-response ratio

Keep the summary professional, encouraging, and actionable. Limit to 200-300 words.";

impl ClassificationChain {
    /// Narrative report over the given emails.
    ///
    /// Only the [`MAX_SUMMARY_EMAILS`] most recent are described; the
    /// category counts cover all of them.
    pub async fn generate_inbox_summary(&self, emails: &[ClassifiedEmail]) -> String {
        let mut recent: Vec<&ClassifiedEmail> = emails.iter().collect();
        recent.sort_by_key(|e| Reverse(e.email.received_at));

        let email_summaries = recent
            .iter()
            .take(MAX_SUMMARY_EMAILS)
            .map(|e| {
                format!(
                    "Date: {}\nCategory: {}\nFrom: {}\nSubject: {}\nSummary: {}",
                    e.email.received_at.format("%Y-%m-%d"),
                    e.classification.category,
                    e.email.sender,
                    e.email.subject,
                    if e.classification.summary.is_empty() {
                        "No summary"
                    } else {
                        e.classification.summary.as_str()
                    }
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n");

        let counts = category_counts(emails);
        let pipeline_stats = Category::ALL
            .iter()
            .map(|c| format!("- {}: {}", c, counts.get(c).copied().unwrap_or(0)))
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = SUMMARY_PROMPT
            .replace("{email_summaries}", &email_summaries)
            .replace("{pipeline_stats}", &pipeline_stats);
        let options = GenerateOptions::default()
            .with_temperature(0.4)
            .with_max_tokens(500);

        match self.llm().generate(&prompt, &options).await {
            Generation::Text(text) => text,
            Generation::Failed(e) => {
                warn!(error = %e, "inbox summary failed");
                format!("Unable to generate summary: {}", e)
            }
        }
    }
}

fn category_counts(emails: &[ClassifiedEmail]) -> BTreeMap<Category, usize> {
    let mut counts = BTreeMap::new();
    for e in emails {
        *counts.entry(e.classification.category).or_insert(0) += 1;
    }
    counts
}

fn percent(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    let pct = part as f64 / whole as f64 * 100.0;
    (pct * 10.0).round() / 10.0
}

/// Job-search metrics for emails received in the last `window_days`.
pub fn analyze_progress(
    emails: &[ClassifiedEmail],
    window_days: i64,
    now: DateTime<Utc>,
) -> ProgressReport {
    let cutoff = now - Duration::days(window_days);
    let recent: Vec<ClassifiedEmail> = emails
        .iter()
        .filter(|e| e.email.received_at >= cutoff)
        .cloned()
        .collect();

    let counts = category_counts(&recent);
    let count = |c: Category| counts.get(&c).copied().unwrap_or(0);
    let applications = count(Category::ApplicationSent);

    let companies: BTreeSet<String> = recent
        .iter()
        .map(employer_company)
        .filter(|c| !c.is_empty())
        .collect();

    ProgressReport {
        period_days: window_days,
        total_emails: recent.len(),
        categories: counts
            .iter()
            .map(|(c, n)| (c.as_str().to_string(), *n))
            .collect(),
        unique_companies: companies.len(),
        metrics: ProgressMetrics {
            applications_sent: applications,
            responses_received: count(Category::RecruiterResponse),
            interviews_scheduled: count(Category::Interview),
            offers_received: count(Category::Offer),
            rejections_received: count(Category::Rejection),
            response_rate_percent: percent(count(Category::RecruiterResponse), applications),
            interview_rate_percent: percent(count(Category::Interview), applications),
            offer_rate_percent: percent(count(Category::Offer), applications),
        },
        companies_contacted: companies
            .into_iter()
            .take(MAX_COMPANIES)
            .collect(),
    }
}

/// Rule-based next actions, most urgent first, at most [`MAX_FOLLOW_UPS`].
///
/// | Category | Elapsed | Condition | Suggestion |
/// |----------|---------|-----------|------------|
/// | Application Sent | ≥ 7 days | no later reply | medium follow-up |
/// | Interview | ≥ 2 days | nothing sent since | high thank-you |
/// | Recruiter Response | ≥ 2 days | | high response |
pub fn suggest_follow_ups(emails: &[ClassifiedEmail], now: DateTime<Utc>) -> Vec<FollowUp> {
    let mut suggestions: Vec<FollowUp> = Vec::new();

    for e in emails {
        let days = (now - e.email.received_at).num_days();
        let who = counterpart(e);

        let suggestion = match e.classification.category {
            Category::ApplicationSent
                if days >= APPLICATION_FOLLOW_UP_DAYS && !has_later_reply(e, emails) =>
            {
                Some((
                    FollowUpKind::FollowUp,
                    Priority::Medium,
                    format!("Follow up on application to {}", who),
                    "No response received after 1 week",
                ))
            }
            Category::Interview
                if days >= INTERVIEW_THANK_YOU_DAYS && !has_later_sent(e, emails) =>
            {
                Some((
                    FollowUpKind::ThankYou,
                    Priority::High,
                    format!("Send thank you note for interview with {}", who),
                    "Interview follow-up is overdue",
                ))
            }
            Category::RecruiterResponse if days >= RECRUITER_REPLY_DAYS => Some((
                FollowUpKind::Response,
                Priority::High,
                format!("Respond to recruiter {}", who),
                "Recruiter response requires timely reply",
            )),
            _ => None,
        };

        if let Some((kind, priority, action, reasoning)) = suggestion {
            suggestions.push(FollowUp {
                kind,
                priority,
                action,
                email_subject: e.email.subject.clone(),
                company: employer_company(e),
                days_since: days,
                reasoning: reasoning.to_string(),
            });
        }
    }

    suggestions.sort_by_key(|s| (s.priority, Reverse(s.days_since)));
    suggestions.truncate(MAX_FOLLOW_UPS);
    info!(count = suggestions.len(), "follow-up suggestions");
    suggestions
}

/// The other party: the recipient of mail the user sent, else the sender.
fn counterpart(e: &ClassifiedEmail) -> &str {
    if sent_by_account(e) {
        e.email.recipient.as_str()
    } else {
        e.email.sender.as_str()
    }
}

/// Company on the other side of the conversation.
///
/// Mail the user sent carries their own provider's domain in `company`, so
/// the guess comes from the recipient address instead.
fn employer_company(e: &ClassifiedEmail) -> String {
    if sent_by_account(e) {
        company_from_address(&parse_sender(&e.email.recipient).address)
    } else {
        e.email.company.trim().to_string()
    }
}

fn sent_by_account(e: &ClassifiedEmail) -> bool {
    !e.email.sender_info.address.is_empty()
        && e.email
            .sender_info
            .address
            .eq_ignore_ascii_case(e.email.account.trim())
}

/// A later email came back from whoever the application went to, or from
/// the same company in any non-application category.
fn has_later_reply(application: &ClassifiedEmail, emails: &[ClassifiedEmail]) -> bool {
    let recipient = parse_sender(&application.email.recipient).address;
    let company = employer_company(application);

    emails.iter().any(|other| {
        if other.email.received_at <= application.email.received_at {
            return false;
        }
        let from_recipient =
            !recipient.is_empty() && other.email.sender_info.address == recipient;
        let from_company = !company.is_empty()
            && employer_company(other) == company
            && other.classification.category != Category::ApplicationSent;
        from_recipient || from_company
    })
}

/// The account sent something after this email arrived.
fn has_later_sent(email: &ClassifiedEmail, emails: &[ClassifiedEmail]) -> bool {
    emails
        .iter()
        .any(|other| other.email.received_at > email.email.received_at && sent_by_account(other))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CanonicalEmail, ClassificationResult, ClassificationSource, SenderInfo};
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 20, 12, 0, 0).unwrap()
    }

    fn classified(
        id: &str,
        category: Category,
        days_ago: i64,
        from: &str,
        to: &str,
        company: &str,
    ) -> ClassifiedEmail {
        ClassifiedEmail {
            email: CanonicalEmail {
                external_id: id.to_string(),
                account: "me@example.com".to_string(),
                subject: format!("subject {}", id),
                sender: from.to_string(),
                sender_info: SenderInfo {
                    name: String::new(),
                    address: from.to_string(),
                },
                recipient: to.to_string(),
                snippet: String::new(),
                body: String::new(),
                received_at: now() - Duration::days(days_ago),
                thread_id: String::new(),
                labels: vec![],
                company: company.to_string(),
            },
            classification: ClassificationResult::new(
                category,
                0.9,
                "summary",
                serde_json::Map::new(),
                ClassificationSource::Model,
            ),
        }
    }

    #[test]
    fn stale_application_gets_medium_follow_up() {
        let emails = vec![classified(
            "a",
            Category::ApplicationSent,
            10,
            "me@example.com",
            "jobs@acme.com",
            "",
        )];
        let s = suggest_follow_ups(&emails, now());
        assert_eq!(s.len(), 1);
        assert_eq!(s[0].priority, Priority::Medium);
        assert_eq!(s[0].kind, FollowUpKind::FollowUp);
        assert_eq!(s[0].days_since, 10);
        assert_eq!(s[0].action, "Follow up on application to jobs@acme.com");
    }

    #[test]
    fn answered_application_is_skipped() {
        let emails = vec![
            classified("a", Category::ApplicationSent, 10, "me@example.com", "jobs@acme.com", ""),
            classified("b", Category::RecruiterResponse, 1, "jobs@acme.com", "me@example.com", "Acme"),
        ];
        let s = suggest_follow_ups(&emails, now());
        assert!(s.iter().all(|f| f.kind != FollowUpKind::FollowUp));
    }

    #[test]
    fn webmail_neighbour_is_not_a_reply() {
        let mut emails = vec![
            classified("a", Category::ApplicationSent, 10, "me@gmail.com", "jobs@acme.com", "Gmail"),
            classified("f", Category::Other, 3, "friend@gmail.com", "me@gmail.com", "Gmail"),
        ];
        for e in &mut emails {
            e.email.account = "me@gmail.com".to_string();
        }
        let s = suggest_follow_ups(&emails, now());
        assert_eq!(s.len(), 1);
        assert_eq!(s[0].priority, Priority::Medium);
        assert_eq!(s[0].company, "Acme");

        let report = analyze_progress(&emails, 30, now());
        assert_eq!(report.companies_contacted, vec!["Acme", "Gmail"]);

        // The employer writing back from another address still counts.
        emails.push(classified("r", Category::Interview, 1, "talent@acme.com", "me@gmail.com", "Acme"));
        emails[2].email.account = "me@gmail.com".to_string();
        assert!(suggest_follow_ups(&emails, now())
            .iter()
            .all(|f| f.kind != FollowUpKind::FollowUp));
    }

    #[test]
    fn recent_interview_gets_thank_you() {
        let emails = vec![classified(
            "i",
            Category::Interview,
            2,
            "hr@acme.com",
            "me@example.com",
            "Acme",
        )];
        let s = suggest_follow_ups(&emails, now());
        assert_eq!(s.len(), 1);
        assert_eq!(s[0].priority, Priority::High);
        assert_eq!(s[0].kind, FollowUpKind::ThankYou);
    }

    #[test]
    fn interview_already_thanked_is_skipped() {
        let emails = vec![
            classified("i", Category::Interview, 4, "hr@acme.com", "me@example.com", "Acme"),
            classified("t", Category::Other, 3, "me@example.com", "hr@acme.com", "Example"),
        ];
        assert!(suggest_follow_ups(&emails, now()).is_empty());
    }

    #[test]
    fn ordering_and_cap() {
        let mut emails = vec![classified(
            "a",
            Category::ApplicationSent,
            30,
            "me@example.com",
            "x@y.com",
            "",
        )];
        for i in 0..12 {
            emails.push(classified(
                &format!("r{}", i),
                Category::RecruiterResponse,
                2 + i,
                "hr@acme.com",
                "me@example.com",
                "Acme",
            ));
        }
        let s = suggest_follow_ups(&emails, now());
        assert_eq!(s.len(), MAX_FOLLOW_UPS);
        assert!(s.iter().all(|f| f.priority == Priority::High));
        assert_eq!(s[0].days_since, 13);
        assert!(s.windows(2).all(|w| w[0].days_since >= w[1].days_since));
    }

    #[test]
    fn progress_rates() {
        let emails = vec![
            classified("a1", Category::ApplicationSent, 1, "me@example.com", "a@acme.com", "Acme"),
            classified("a2", Category::ApplicationSent, 2, "me@example.com", "b@beta.com", "Beta"),
            classified("a3", Category::ApplicationSent, 3, "me@example.com", "c@gamma.com", "Gamma"),
            classified("r1", Category::RecruiterResponse, 1, "a@acme.com", "me@example.com", "Acme"),
            classified("i1", Category::Interview, 1, "a@acme.com", "me@example.com", "Acme"),
            classified("old", Category::Offer, 90, "a@acme.com", "me@example.com", "Acme"),
        ];
        let report = analyze_progress(&emails, 30, now());
        assert_eq!(report.total_emails, 5);
        assert_eq!(report.metrics.applications_sent, 3);
        assert_eq!(report.metrics.response_rate_percent, 33.3);
        assert_eq!(report.metrics.interview_rate_percent, 33.3);
        assert_eq!(report.metrics.offer_rate_percent, 0.0);
        assert_eq!(report.categories["Application Sent"], 3);
        assert_eq!(report.unique_companies, 3);
        assert_eq!(report.companies_contacted, vec!["Acme", "Beta", "Gamma"]);
    }

    #[test]
    fn progress_without_applications_has_zero_rates() {
        let emails = vec![classified(
            "r",
            Category::RecruiterResponse,
            1,
            "a@acme.com",
            "me@example.com",
            "Acme",
        )];
        let report = analyze_progress(&emails, 30, now());
        assert_eq!(report.metrics.response_rate_percent, 0.0);
        assert_eq!(report.metrics.applications_sent, 0);

        let empty = analyze_progress(&[], 7, now());
        assert_eq!(empty.total_emails, 0);
        assert!(empty.companies_contacted.is_empty());
    }
}
