//! 状态条件工具
//!
//! 条件列表在语义上是按 `type` 唯一的有序映射。更新采用 upsert：替换同类型条件
//! 或追加到末尾，其余条件保持原有顺序不变；只有 `status` 变化时才推进
//! `lastTransitionTime`。

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};

/// 条件状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl ConditionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionStatus::True => "True",
            ConditionStatus::False => "False",
            ConditionStatus::Unknown => "Unknown",
        }
    }
}

/// 构造一个条件，`lastTransitionTime` 由 upsert 决定
pub fn new_condition(
    type_: &str,
    status: ConditionStatus,
    reason: &str,
    message: impl Into<String>,
) -> Condition {
    Condition {
        type_: type_.to_string(),
        status: status.as_str().to_string(),
        reason: reason.to_string(),
        message: message.into(),
        last_transition_time: Time(Utc::now()),
        observed_generation: None,
    }
}

/// 按类型查找条件
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// 条件是否为 True
pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    find_condition(conditions, type_).map_or(false, |c| c.status == "True")
}

/// 按类型更新或追加条件
///
/// 已存在时只在 `status` 变化时把 `lastTransitionTime` 设为当前时间，
/// 否则沿用旧值；新增时使用当前时间。
pub fn upsert_condition(conditions: &mut Vec<Condition>, mut condition: Condition) {
    let now = Time(Utc::now());
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            condition.last_transition_time = if existing.status != condition.status {
                now
            } else {
                existing.last_transition_time.clone()
            };
            *existing = condition;
        }
        None => {
            condition.last_transition_time = now;
            conditions.push(condition);
        }
    }
}

/// 按类型移除条件
pub fn remove_condition(conditions: &mut Vec<Condition>, type_: &str) {
    conditions.retain(|c| c.type_ != type_);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn condition_at(type_: &str, status: ConditionStatus, reason: &str, year: i32) -> Condition {
        let mut condition = new_condition(type_, status, reason, "");
        condition.last_transition_time = Time(Utc.with_ymd_and_hms(year, 1, 1, 0, 0, 0).unwrap());
        condition
    }

    #[test]
    fn test_upsert_appends_and_preserves_order() {
        let a = condition_at("A", ConditionStatus::True, "R", 2020);
        let mut conditions = vec![a.clone()];

        upsert_condition(&mut conditions, new_condition("B", ConditionStatus::True, "R", ""));

        assert_eq!(conditions.len(), 2);
        assert_eq!(conditions[0], a);
        assert_eq!(conditions[1].type_, "B");
    }

    #[test]
    fn test_upsert_status_change_advances_transition_time() {
        let old = condition_at("A", ConditionStatus::True, "R1", 2020);
        let mut conditions = vec![
            condition_at("X", ConditionStatus::True, "R", 2019),
            old.clone(),
            condition_at("Y", ConditionStatus::False, "R", 2019),
        ];

        upsert_condition(
            &mut conditions,
            new_condition("A", ConditionStatus::False, "R2", "changed"),
        );

        assert_eq!(conditions.len(), 3);
        assert_eq!(conditions[0].type_, "X");
        assert_eq!(conditions[2].type_, "Y");
        let updated = &conditions[1];
        assert_eq!(updated.status, "False");
        assert_eq!(updated.reason, "R2");
        assert_eq!(updated.message, "changed");
        assert!(updated.last_transition_time.0 > old.last_transition_time.0);
    }

    #[test]
    fn test_upsert_same_status_keeps_transition_time() {
        let old = condition_at("A", ConditionStatus::True, "R1", 2020);
        let mut conditions = vec![old.clone()];

        upsert_condition(
            &mut conditions,
            new_condition("A", ConditionStatus::True, "R1-renamed", "msg"),
        );
        assert_eq!(conditions[0].last_transition_time, old.last_transition_time);
        assert_eq!(conditions[0].reason, "R1-renamed");

        let snapshot = conditions.clone();
        upsert_condition(
            &mut conditions,
            new_condition("A", ConditionStatus::True, "R1-renamed", "msg"),
        );
        assert_eq!(conditions, snapshot);
    }

    #[test]
    fn test_find_and_remove() {
        let mut conditions = vec![
            condition_at("A", ConditionStatus::True, "R", 2020),
            condition_at("B", ConditionStatus::False, "R", 2020),
        ];
        assert!(is_condition_true(&conditions, "A"));
        assert!(!is_condition_true(&conditions, "B"));
        assert!(!is_condition_true(&conditions, "C"));

        remove_condition(&mut conditions, "A");
        assert!(find_condition(&conditions, "A").is_none());
        assert_eq!(conditions.len(), 1);
    }
}
