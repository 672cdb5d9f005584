//! Quota admission against per-project day/month request counters.
//!
//! Admission only compares the stored counters to the limits; the counters
//! themselves advance after a successful forward (usage tracker), so a failed
//! upstream call never burns budget. Rollover is the reset task's job — the
//! hot path never consults the clock.

use axum::http::HeaderName;

use aiguard_types::{Project, QuotaLimits};

const WARNING_RATIO: f64 = 0.9;

/// Outcome of a quota check, carried on every response.
#[derive(Debug, Clone)]
pub struct QuotaDecision {
    pub allowed: bool,
    /// `"daily"` or `"monthly"` when denied.
    pub denied_bucket: Option<&'static str>,
    pub daily_used: u64,
    pub daily_limit: u64,
    pub monthly_used: u64,
    pub monthly_limit: u64,
}

impl QuotaDecision {
    /// `X-Quota-*` headers, plus `X-Quota-Warning` at ≥90% of either bucket.
    pub fn headers(&self) -> Vec<(HeaderName, String)> {
        let mut headers = vec![
            (
                HeaderName::from_static("x-quota-daily-used"),
                self.daily_used.to_string(),
            ),
            (
                HeaderName::from_static("x-quota-daily-limit"),
                self.daily_limit.to_string(),
            ),
            (
                HeaderName::from_static("x-quota-monthly-used"),
                self.monthly_used.to_string(),
            ),
            (
                HeaderName::from_static("x-quota-monthly-limit"),
                self.monthly_limit.to_string(),
            ),
        ];
        if let Some(warning) = self.warning() {
            headers.push((HeaderName::from_static("x-quota-warning"), warning));
        }
        headers
    }

    fn warning(&self) -> Option<String> {
        let daily_hot = ratio(self.daily_used, self.daily_limit) >= WARNING_RATIO;
        let monthly_hot = ratio(self.monthly_used, self.monthly_limit) >= WARNING_RATIO;
        match (daily_hot, monthly_hot) {
            (true, _) => Some(format!(
                "daily quota at {}/{}",
                self.daily_used, self.daily_limit
            )),
            (false, true) => Some(format!(
                "monthly quota at {}/{}",
                self.monthly_used, self.monthly_limit
            )),
            _ => None,
        }
    }
}

fn ratio(used: u64, limit: u64) -> f64 {
    if limit == 0 {
        return 1.0;
    }
    used as f64 / limit as f64
}

/// Effective limits: project override, else tier default.
pub fn limits_for(project: &Project) -> QuotaLimits {
    project
        .settings
        .quota
        .unwrap_or_else(|| project.tier().default_quota())
}

/// Admission rule: both `dayRequests < dayLimit` and `monthRequests < monthLimit`.
pub fn admit(project: &Project) -> QuotaDecision {
    let limits = limits_for(project);
    let daily_used = project.usage.current_day.requests;
    let monthly_used = project.usage.current_month.requests;

    let denied_bucket = if daily_used >= limits.daily {
        Some("daily")
    } else if monthly_used >= limits.monthly {
        Some("monthly")
    } else {
        None
    };

    QuotaDecision {
        allowed: denied_bucket.is_none(),
        denied_bucket,
        daily_used,
        daily_limit: limits.daily,
        monthly_used,
        monthly_limit: limits.monthly,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aiguard_types::{MemberRole, ProjectMember, ProjectSettings, UsageCounters};
    use chrono::Utc;

    fn project(daily_used: u64, monthly_used: u64) -> Project {
        let mut usage = UsageCounters::default();
        usage.current_day.requests = daily_used;
        usage.current_month.requests = monthly_used;
        Project {
            id: "p1".to_string(),
            name: "p".to_string(),
            owner_id: "u1".to_string(),
            members: vec![ProjectMember {
                user_id: "u1".to_string(),
                role: MemberRole::Owner,
                added_at: Utc::now(),
            }],
            credentials: vec![],
            settings: ProjectSettings::default(),
            usage,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn under_both_limits_is_admitted() {
        let decision = admit(&project(5, 50));
        assert!(decision.allowed);
        assert!(decision.denied_bucket.is_none());
    }

    #[test]
    fn daily_exhaustion_denies_with_daily_bucket() {
        // Free tier: 100/day.
        let decision = admit(&project(100, 100));
        assert!(!decision.allowed);
        assert_eq!(decision.denied_bucket, Some("daily"));
    }

    #[test]
    fn monthly_exhaustion_denies_with_monthly_bucket() {
        // Free tier: 1000/month.
        let decision = admit(&project(10, 1_000));
        assert!(!decision.allowed);
        assert_eq!(decision.denied_bucket, Some("monthly"));
    }

    #[test]
    fn override_takes_precedence_over_tier() {
        let mut p = project(1, 1);
        p.settings.quota = Some(QuotaLimits { daily: 1, monthly: 10 });
        let decision = admit(&p);
        assert!(!decision.allowed);
        assert_eq!(decision.denied_bucket, Some("daily"));
    }

    #[test]
    fn warning_appears_at_ninety_percent() {
        let decision = admit(&project(90, 100));
        assert!(decision.allowed);
        let headers = decision.headers();
        assert!(headers
            .iter()
            .any(|(name, _)| name.as_str() == "x-quota-warning"));

        let calm = admit(&project(50, 100));
        assert!(!calm
            .headers()
            .iter()
            .any(|(name, _)| name.as_str() == "x-quota-warning"));
    }

    #[test]
    fn headers_carry_usage_and_limits() {
        let headers = admit(&project(7, 70)).headers();
        let get = |name: &str| {
            headers
                .iter()
                .find(|(n, _)| n.as_str() == name)
                .map(|(_, v)| v.clone())
        };
        assert_eq!(get("x-quota-daily-used").as_deref(), Some("7"));
        assert_eq!(get("x-quota-daily-limit").as_deref(), Some("100"));
        assert_eq!(get("x-quota-monthly-used").as_deref(), Some("70"));
        assert_eq!(get("x-quota-monthly-limit").as_deref(), Some("1000"));
    }
}
