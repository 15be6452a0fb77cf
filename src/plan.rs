use crate::model::{ClassRef, PromotionCommand, PromotionRules, Student};
use crate::resolver::RuleMatch;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanEntry {
    pub class: ClassRef,
    pub next_class: Option<ClassRef>,
    pub students: Vec<Student>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_by: Option<RuleMatch>,
}

impl PlanEntry {
    pub fn is_eligible(&self) -> bool {
        self.next_class.is_some()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SelectionMode {
    #[default]
    All,
    Individual,
}

impl SelectionMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" => Some(Self::All),
            "individual" => Some(Self::Individual),
            _ => None,
        }
    }
}

/// Students grouped by current class id, roster order kept within a class.
/// Students without a class are left out.
pub fn group_by_class(students: &[Student]) -> BTreeMap<String, Vec<Student>> {
    let mut out: BTreeMap<String, Vec<Student>> = BTreeMap::new();
    for s in students {
        if let Some(cid) = s.current_class_id() {
            out.entry(cid.to_string()).or_default().push(s.clone());
        }
    }
    out
}

// Case-folded first so "grade 10" sits next to "Grade 1", then raw text, then id.
fn class_order(a: &ClassRef, b: &ClassRef) -> Ordering {
    a.name
        .to_lowercase()
        .cmp(&b.name.to_lowercase())
        .then_with(|| a.name.cmp(&b.name))
        .then_with(|| a.id.cmp(&b.id))
}

pub fn build_plan(
    classes: &[ClassRef],
    students: &[Student],
    rules: &PromotionRules,
) -> Vec<PlanEntry> {
    let mut grouped = group_by_class(students);
    let mut plan: Vec<PlanEntry> = Vec::new();

    for class in classes {
        let Some(members) = grouped.remove(&class.id) else {
            continue;
        };
        let resolution = rules.resolve_for(class, classes);
        plan.push(PlanEntry {
            class: class.clone(),
            next_class: resolution.next_class,
            students: members,
            matched_by: resolution.rule,
        });
    }

    // Whatever is left references classes the directory does not list.
    for (class_id, members) in grouped {
        tracing::warn!(
            class_id = %class_id,
            students = members.len(),
            "students reference an unknown class; they will not be promoted"
        );
        plan.push(PlanEntry {
            class: ClassRef::placeholder(class_id),
            next_class: None,
            students: members,
            matched_by: None,
        });
    }

    plan.sort_by(|a, b| class_order(&a.class, &b.class));
    plan
}

/// Finds the plan entry holding `student_id`.
pub fn entry_for_student<'a>(plan: &'a [PlanEntry], student_id: &str) -> Option<&'a PlanEntry> {
    plan.iter()
        .find(|e| e.students.iter().any(|s| s.id == student_id))
}

pub fn select_commands(
    plan: &[PlanEntry],
    mode: SelectionMode,
    selected: &HashSet<String>,
) -> Vec<PromotionCommand> {
    let mut out = Vec::new();
    for entry in plan {
        let Some(next) = entry.next_class.as_ref() else {
            continue;
        };
        for s in &entry.students {
            if mode == SelectionMode::Individual && !selected.contains(&s.id) {
                continue;
            }
            out.push(PromotionCommand {
                student_id: s.id.clone(),
                student_number: s.student_number.clone(),
                from_class_id: entry.class.id.clone(),
                to_class_id: next.id.clone(),
            });
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PromotionRuleTable;
    use pretty_assertions::assert_eq;

    fn student(id: &str, class_id: Option<&str>) -> Student {
        Student {
            id: id.into(),
            student_number: format!("N-{id}"),
            first_name: "First".into(),
            last_name: "Last".into(),
            class_id: class_id.map(str::to_string),
        }
    }

    fn rules(pairs: &[(&str, &str)]) -> PromotionRules {
        PromotionRules::from_table(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<PromotionRuleTable>(),
        )
    }

    fn two_grades() -> (Vec<ClassRef>, Vec<Student>, PromotionRules) {
        let classes = vec![
            ClassRef::new("c1", "Grade 1", ""),
            ClassRef::new("c2", "Grade 2", ""),
        ];
        let students = vec![student("s1", Some("c1")), student("s2", Some("c2"))];
        let rules = rules(&[("Grade 1", "Grade 2"), ("Grade 2", "Completed")]);
        (classes, students, rules)
    }

    #[test]
    fn two_grade_scenario() {
        let (classes, students, rules) = two_grades();
        let plan = build_plan(&classes, &students, &rules);
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].class.id, "c1");
        assert_eq!(plan[0].next_class.as_ref().map(|c| c.id.as_str()), Some("c2"));
        assert_eq!(plan[1].class.id, "c2");
        assert_eq!(plan[1].next_class, None);

        let cmds = select_commands(&plan, SelectionMode::All, &HashSet::new());
        assert_eq!(
            cmds,
            vec![PromotionCommand {
                student_id: "s1".into(),
                student_number: "N-s1".into(),
                from_class_id: "c1".into(),
                to_class_id: "c2".into(),
            }]
        );
    }

    #[test]
    fn every_classed_student_lands_in_exactly_one_entry() {
        let classes = vec![
            ClassRef::new("c1", "Grade 1", ""),
            ClassRef::new("c2", "Grade 2", ""),
            ClassRef::new("c3", "Grade 3", ""),
        ];
        let students = vec![
            student("a", Some("c1")),
            student("b", None),
            student("c", Some("c2")),
            student("d", Some("c1")),
            student("e", Some("ghost")),
            student("f", Some("")),
        ];
        let plan = build_plan(&classes, &students, &rules(&[]));

        for s in &students {
            let hits = plan
                .iter()
                .filter(|e| e.students.iter().any(|x| x.id == s.id))
                .count();
            let expected = usize::from(s.current_class_id().is_some());
            assert_eq!(hits, expected, "student {}", s.id);
        }
        // c3 has no students and gets no entry.
        assert!(plan.iter().all(|e| e.class.id != "c3"));
        let ghost = plan.iter().find(|e| e.class.id == "ghost").expect("ghost entry");
        assert!(!ghost.is_eligible());
    }

    #[test]
    fn plan_is_sorted_by_class_name() {
        let classes = vec![
            ClassRef::new("b", "grade 2", ""),
            ClassRef::new("a", "Grade 10", ""),
            ClassRef::new("c", "Form 1", ""),
        ];
        let students = vec![
            student("1", Some("b")),
            student("2", Some("a")),
            student("3", Some("c")),
        ];
        let plan = build_plan(&classes, &students, &rules(&[]));
        let names: Vec<&str> = plan.iter().map(|e| e.class.name.as_str()).collect();
        assert_eq!(names, vec!["Form 1", "Grade 10", "grade 2"]);
    }

    #[test]
    fn roster_order_is_preserved_within_a_class() {
        let students = vec![
            student("z", Some("c1")),
            student("a", Some("c1")),
            student("m", Some("c1")),
        ];
        let grouped = group_by_class(&students);
        let ids: Vec<&str> = grouped["c1"].iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["z", "a", "m"]);
    }

    #[test]
    fn individual_mode_skips_ineligible_selection() {
        let (classes, students, rules) = two_grades();
        let plan = build_plan(&classes, &students, &rules);
        let selected: HashSet<String> = ["s1".to_string(), "s2".to_string()].into();
        let cmds = select_commands(&plan, SelectionMode::Individual, &selected);
        assert_eq!(cmds.len(), 1);
        assert_eq!(cmds[0].student_id, "s1");
    }

    #[test]
    fn individual_mode_with_empty_selection_emits_nothing() {
        let (classes, students, rules) = two_grades();
        let plan = build_plan(&classes, &students, &rules);
        assert!(select_commands(&plan, SelectionMode::Individual, &HashSet::new()).is_empty());
    }

    #[test]
    fn command_targets_always_match_resolved_next_class() {
        let classes = vec![
            ClassRef::new("c1", "Grade 1A", ""),
            ClassRef::new("c1b", "Grade 1B", ""),
            ClassRef::new("c2", "Grade 2A", ""),
        ];
        let students = vec![
            student("s1", Some("c1")),
            student("s2", Some("c1b")),
            student("s3", Some("c1b")),
        ];
        let plan = build_plan(&classes, &students, &rules(&[("Grade 1", "Grade 2")]));
        let cmds = select_commands(&plan, SelectionMode::All, &HashSet::new());
        assert_eq!(cmds.len(), 3);
        for cmd in &cmds {
            let entry = entry_for_student(&plan, &cmd.student_id).expect("entry");
            assert_eq!(entry.class.id, cmd.from_class_id);
            assert_eq!(
                entry.next_class.as_ref().map(|c| c.id.as_str()),
                Some(cmd.to_class_id.as_str())
            );
        }
    }

    #[test]
    fn mode_parse_accepts_known_values() {
        assert_eq!(SelectionMode::parse("ALL"), Some(SelectionMode::All));
        assert_eq!(SelectionMode::parse("individual"), Some(SelectionMode::Individual));
        assert_eq!(SelectionMode::parse("some"), None);
    }
}
