//! ============================================================================
//! Self-Improvement Loop - Periodic review of recorded outcomes
//! ============================================================================
//! Turns repeated tool failures into durable "lesson" skills, prunes stale
//! memory and logs a health summary. Each step commits on its own, so a
//! failure part-way keeps the work already done and a rerun is harmless.
//! ============================================================================

mod scheduler;

pub use scheduler::{AlwaysRun, CycleOutcome, MaintenanceJob, MaintenanceScheduler, RunConstraint};

use anyhow::Result;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info};

use crate::db::PruneReport;
use crate::memory::{FeedbackScore, LearnedSkill, MemoryStore, TurnFilter};

/// Prefix shared by every lesson skill
pub const LESSON_PREFIX: &str = "lesson:";

/// Lesson written when failed turns used no tools at all
pub const DIRECT_RESPONSE_LESSON: &str = "lesson:direct-response-failures";

/// Skill name of the lesson for a tool
pub fn lesson_name(tool: &str) -> String {
    format!("{}{}", LESSON_PREFIX, tool)
}

/// Tuning for one review pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewConfig {
    /// Most recent failed turns examined
    pub failure_window: usize,
    /// Failures needed before a lesson is written
    pub lesson_threshold: usize,
    /// Memory older than this is pruned
    pub prune_max_age_ms: i64,
    /// Recent turns counted in the summary
    pub summary_window: usize,
    /// Skills listed in the summary
    pub top_skills: usize,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            failure_window: 20,
            lesson_threshold: 3,
            prune_max_age_ms: 30 * 24 * 60 * 60 * 1000,
            summary_window: 50,
            top_skills: 5,
        }
    }
}

/// A skill as ranked in the health summary
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkillRating {
    pub name: String,
    pub success_rate: f64,
    pub success_count: u32,
    pub fail_count: u32,
}

/// Outcome of one review pass
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSummary {
    /// Lesson skills written or refreshed this pass
    pub lessons: Vec<String>,
    pub pruned: PruneReport,
    pub recent_successes: usize,
    pub recent_failures: usize,
    pub positive_feedback: usize,
    pub negative_feedback: usize,
    pub skill_count: usize,
    pub top_skills: Vec<SkillRating>,
}

/// Periodic maintenance over the memory store
pub struct SelfImprovementLoop {
    store: Arc<MemoryStore>,
    config: ReviewConfig,
}

impl SelfImprovementLoop {
    pub fn new(store: Arc<MemoryStore>, config: ReviewConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &ReviewConfig {
        &self.config
    }

    /// One full pass: lessons, pruning, summary
    pub fn run_once(&self) -> Result<HealthSummary> {
        let lessons = self.learn_from_failures()?;
        let pruned = self.store.prune_old_memories(self.config.prune_max_age_ms)?;
        let summary = self.summarize(lessons, pruned)?;
        log_summary(&summary);
        Ok(summary)
    }

    /// Write a lesson for every tool that failed often enough recently
    fn learn_from_failures(&self) -> Result<Vec<String>> {
        let failed = self
            .store
            .db()
            .recent_turns(self.config.failure_window, TurnFilter::Failed)?;
        if failed.is_empty() {
            debug!("No recent failures to learn from");
            return Ok(Vec::new());
        }

        let mut per_tool: BTreeMap<&str, usize> = BTreeMap::new();
        let mut without_tools = 0;
        for turn in &failed {
            if turn.tools_used.is_empty() {
                without_tools += 1;
                continue;
            }
            let distinct: BTreeSet<&str> = turn.tools_used.iter().map(String::as_str).collect();
            for tool in distinct {
                *per_tool.entry(tool).or_insert(0) += 1;
            }
        }

        let mut lessons = Vec::new();
        for (tool, failures) in per_tool {
            if failures < self.config.lesson_threshold {
                continue;
            }
            let name = lesson_name(tool);
            self.store.learn_skill(
                &name,
                &format!(
                    "The {} tool was involved in {} of the last {} failed turns.",
                    tool,
                    failures,
                    failed.len()
                ),
                &format!(
                    "Before calling {}, check the current screen state and the parameters, then verify the result before moving on.",
                    tool
                ),
            )?;
            lessons.push(name);
        }

        if without_tools >= self.config.lesson_threshold {
            self.store.learn_skill(
                DIRECT_RESPONSE_LESSON,
                &format!(
                    "{} of the last {} failed turns were answered without using any tool.",
                    without_tools,
                    failed.len()
                ),
                "When a request needs the device, act through a tool instead of answering from memory.",
            )?;
            lessons.push(DIRECT_RESPONSE_LESSON.to_string());
        }

        Ok(lessons)
    }

    fn summarize(&self, lessons: Vec<String>, pruned: PruneReport) -> Result<HealthSummary> {
        let recent = self
            .store
            .db()
            .recent_turns(self.config.summary_window, TurnFilter::All)?;
        let recent_successes = recent.iter().filter(|t| t.was_successful).count();

        let mut positive_feedback = 0;
        let mut negative_feedback = 0;
        for turn in &recent {
            match turn.feedback_score {
                FeedbackScore::Positive => positive_feedback += 1,
                FeedbackScore::Negative => negative_feedback += 1,
                FeedbackScore::Unset => {}
            }
        }

        let skills = self.store.db().list_skills()?;
        let skill_count = skills.len();

        Ok(HealthSummary {
            lessons,
            pruned,
            recent_successes,
            recent_failures: recent.len() - recent_successes,
            positive_feedback,
            negative_feedback,
            skill_count,
            top_skills: rank_skills(skills, self.config.top_skills),
        })
    }
}

/// Highest success rate first; ties go to the more used, then by name
fn rank_skills(mut skills: Vec<LearnedSkill>, limit: usize) -> Vec<SkillRating> {
    skills.sort_by(|a, b| {
        b.success_rate()
            .partial_cmp(&a.success_rate())
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.success_count.cmp(&a.success_count))
            .then_with(|| a.name.cmp(&b.name))
    });

    skills
        .into_iter()
        .take(limit)
        .map(|s| SkillRating {
            success_rate: s.success_rate(),
            success_count: s.success_count,
            fail_count: s.fail_count,
            name: s.name,
        })
        .collect()
}

fn log_summary(summary: &HealthSummary) {
    info!(
        recent_successes = summary.recent_successes,
        recent_failures = summary.recent_failures,
        positive_feedback = summary.positive_feedback,
        negative_feedback = summary.negative_feedback,
        skill_count = summary.skill_count,
        lessons = summary.lessons.len(),
        pruned = summary.pruned.total(),
        "Self-improvement pass complete"
    );
    for skill in &summary.top_skills {
        info!(
            "  {} success rate {:.2} ({} ok / {} failed)",
            skill.name, skill.success_rate, skill.success_count, skill.fail_count
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Arc<MemoryStore> {
        Arc::new(MemoryStore::open_in_memory().unwrap())
    }

    fn tools(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_repeated_tool_failure_writes_one_lesson() {
        let store = store();
        store.remember("tap ok", "done", &tools(&["tap"]), true).unwrap();
        store.remember("tap 1", "failed", &tools(&["tap", "tap"]), false).unwrap();
        store.remember("tap 2", "failed", &tools(&["tap", "swipe"]), false).unwrap();
        store.remember("tap 3", "failed", &tools(&["screenshot", "tap"]), false).unwrap();

        let review = SelfImprovementLoop::new(store.clone(), ReviewConfig::default());
        let summary = review.run_once().unwrap();

        assert_eq!(summary.lessons, vec!["lesson:tap".to_string()]);
        let skills = store.db().list_skills().unwrap();
        assert_eq!(skills.len(), 1);
        assert_eq!(skills[0].name, "lesson:tap");
        assert_eq!(summary.recent_successes, 1);
        assert_eq!(summary.recent_failures, 3);
    }

    #[test]
    fn test_rerun_is_idempotent_but_refreshes_timestamp() {
        let store = store();
        for i in 0..3 {
            store.remember(&format!("tap {}", i), "failed", &tools(&["tap"]), false).unwrap();
        }
        let review = SelfImprovementLoop::new(store.clone(), ReviewConfig::default());

        review.run_once().unwrap();
        let first = store.db().get_skill("lesson:tap").unwrap().unwrap();
        review.run_once().unwrap();
        let second = store.db().get_skill("lesson:tap").unwrap().unwrap();

        assert_eq!(store.db().list_skills().unwrap().len(), 1);
        assert!(second.last_updated > first.last_updated);
        assert_eq!(second.success_count, first.success_count);
        assert_eq!(second.fail_count, first.fail_count);
    }

    #[test]
    fn test_below_threshold_writes_nothing() {
        let store = store();
        store.remember("a", "failed", &tools(&["tap"]), false).unwrap();
        store.remember("b", "failed", &tools(&["tap"]), false).unwrap();

        let summary = SelfImprovementLoop::new(store.clone(), ReviewConfig::default())
            .run_once()
            .unwrap();
        assert!(summary.lessons.is_empty());
        assert_eq!(summary.skill_count, 0);
    }

    #[test]
    fn test_toolless_failures_write_direct_response_lesson() {
        let store = store();
        for i in 0..3 {
            store.remember(&format!("question {}", i), "wrong", &[], false).unwrap();
        }

        let summary = SelfImprovementLoop::new(store.clone(), ReviewConfig::default())
            .run_once()
            .unwrap();
        assert_eq!(summary.lessons, vec![DIRECT_RESPONSE_LESSON.to_string()]);
    }

    #[tokio::test]
    async fn test_summary_counts_feedback_and_ranks_skills() {
        let store = store();
        let liked = store.remember("a", "ok", &[], true).unwrap();
        let disliked = store.remember("b", "ok", &[], true).unwrap();
        store.give_feedback(liked.id, FeedbackScore::Positive);
        store.give_feedback(disliked.id, FeedbackScore::Negative);
        store.flush_background().await;

        store.learn_skill("steady", "", "").unwrap();
        store.learn_skill("flaky", "", "").unwrap();
        store.record_skill_outcome("steady", true).unwrap();
        store.record_skill_outcome("flaky", true).unwrap();
        store.record_skill_outcome("flaky", false).unwrap();

        let summary = SelfImprovementLoop::new(store.clone(), ReviewConfig::default())
            .run_once()
            .unwrap();
        assert_eq!(summary.positive_feedback, 1);
        assert_eq!(summary.negative_feedback, 1);
        assert_eq!(summary.skill_count, 2);
        assert_eq!(summary.top_skills[0].name, "steady");
        assert!((summary.top_skills[1].success_rate - 0.5).abs() < 1e-9);
    }
}
