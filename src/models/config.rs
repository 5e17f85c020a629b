//! The declarative configuration: instance identity, repos, and plans.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::{AppError, Result};
use crate::models::plan::Plan;
use crate::models::repo::Repo;
use crate::services::hook_service::validate_template;

/// The whole declarative configuration, as persisted in `config.json`.
///
/// `modno` is a revision counter bumped on every successful write; writers
/// must present the current value (compare-and-set).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, ToSchema)]
pub struct Config {
    #[serde(default)]
    pub modno: i64,
    /// Identity of this instance; stamped on every operation it creates.
    pub instance: String,
    #[serde(default)]
    pub repos: Vec<Repo>,
    #[serde(default)]
    pub plans: Vec<Plan>,
}

impl Config {
    pub fn repo(&self, id: &str) -> Option<&Repo> {
        self.repos.iter().find(|r| r.id == id)
    }

    pub fn plan(&self, id: &str) -> Option<&Plan> {
        self.plans.iter().find(|p| p.id == id)
    }

    /// Resolve the repo a plan backs up into.
    pub fn repo_for_plan(&self, plan: &Plan) -> Option<&Repo> {
        self.repo(&plan.repo)
    }

    /// Validate the configuration. All rules must pass before a new config
    /// is accepted.
    pub fn validate(&self) -> Result<()> {
        if self.instance.is_empty() {
            return Err(AppError::Validation("instance id must not be empty".into()));
        }

        let mut repo_ids = HashSet::new();
        for repo in &self.repos {
            if repo.id.is_empty() {
                return Err(AppError::Validation("repo id must not be empty".into()));
            }
            if repo.guid.is_empty() {
                return Err(AppError::Validation(format!(
                    "repo \"{}\" has no guid",
                    repo.id
                )));
            }
            if repo.uri.is_empty() {
                return Err(AppError::Validation(format!(
                    "repo \"{}\" has no uri",
                    repo.id
                )));
            }
            if repo.password.is_empty() {
                return Err(AppError::Validation(format!(
                    "repo \"{}\" has no password",
                    repo.id
                )));
            }
            if !repo_ids.insert(repo.id.as_str()) {
                return Err(AppError::Validation(format!(
                    "duplicate repo id \"{}\"",
                    repo.id
                )));
            }
            repo.prune_policy.schedule.validate()?;
            repo.check_policy.schedule.validate()?;
            for hook in &repo.hooks {
                for template in hook.templates() {
                    validate_template(template)?;
                }
            }
        }

        let mut plan_ids = HashSet::new();
        for plan in &self.plans {
            if plan.id.is_empty() {
                return Err(AppError::Validation("plan id must not be empty".into()));
            }
            if !plan_ids.insert(plan.id.as_str()) {
                return Err(AppError::Validation(format!(
                    "duplicate plan id \"{}\"",
                    plan.id
                )));
            }
            if !repo_ids.contains(plan.repo.as_str()) {
                return Err(AppError::Validation(format!(
                    "plan \"{}\" references unknown repo \"{}\"",
                    plan.id, plan.repo
                )));
            }
            plan.schedule.validate()?;
            plan.retention.validate()?;
            for hook in &plan.hooks {
                for template in hook.templates() {
                    validate_template(template)?;
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::plan::{RetentionPolicy, Schedule, SchedulePolicy};

    fn base_config() -> Config {
        Config {
            modno: 1,
            instance: "test".into(),
            repos: vec![Repo {
                id: "local".into(),
                guid: "guid-1".into(),
                uri: "/tmp/repo".into(),
                password: "secret".into(),
                ..Default::default()
            }],
            plans: vec![Plan {
                id: "daily".into(),
                repo: "local".into(),
                paths: vec!["/data".into()],
                schedule: SchedulePolicy {
                    schedule: Schedule::Cron { expr: "0 2 * * *".into() },
                    ..Default::default()
                },
                retention: RetentionPolicy::KeepLastN { count: 30 },
                ..Default::default()
            }],
        }
    }

    #[test]
    fn valid_config_passes() {
        base_config().validate().unwrap();
    }

    #[test]
    fn empty_repo_fields_rejected() {
        let mut cfg = base_config();
        cfg.repos[0].password = String::new();
        assert!(cfg.validate().is_err());

        let mut cfg = base_config();
        cfg.repos[0].guid = String::new();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn dangling_plan_repo_rejected() {
        let mut cfg = base_config();
        cfg.plans[0].repo = "nope".into();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("unknown repo"));
    }

    #[test]
    fn duplicate_ids_rejected() {
        let mut cfg = base_config();
        cfg.repos.push(cfg.repos[0].clone());
        assert!(cfg.validate().is_err());

        let mut cfg = base_config();
        cfg.plans.push(cfg.plans[0].clone());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn bad_cron_rejected() {
        let mut cfg = base_config();
        cfg.plans[0].schedule = SchedulePolicy {
            schedule: Schedule::Cron { expr: "not valid".into() },
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn bad_retention_within_rejected() {
        let mut cfg = base_config();
        cfg.plans[0].retention = RetentionPolicy::KeepByTime {
            hourly: 0,
            daily: 7,
            weekly: 0,
            monthly: 0,
            yearly: 0,
            within: "x1".into(),
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn config_roundtrips_through_json() {
        let cfg = base_config();
        let json = serde_json::to_string_pretty(&cfg).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cfg);
    }
}
