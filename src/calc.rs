use crate::model::{GradeSheet, GradeSheetStatus, PanelGrades, PanelSlot, Remark, Student};
use crate::rubric::Rubric;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const DEFAULT_TITLE_DEFENSE_SHARE: f64 = 70.0;
pub const DEFAULT_INDIVIDUAL_SHARE: f64 = 30.0;
pub const DEFAULT_PASSING_SCORE: f64 = 70.0;

/// Share of a panel's 100 points given to each rubric, plus the pass cutoff.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradingPolicy {
    pub title_defense_share: f64,
    pub individual_share: f64,
    pub passing_score: f64,
}

impl Default for GradingPolicy {
    fn default() -> Self {
        Self {
            title_defense_share: DEFAULT_TITLE_DEFENSE_SHARE,
            individual_share: DEFAULT_INDIVIDUAL_SHARE,
            passing_score: DEFAULT_PASSING_SCORE,
        }
    }
}

/// Round half up to `places` decimals. Display only; never applied inside
/// the aggregation functions.
pub fn round_off(x: f64, places: u32) -> f64 {
    let scale = 10_f64.powi(places as i32);
    ((x * scale) + 0.5).floor() / scale
}

fn score_or_zero(v: Option<&f64>) -> f64 {
    match v {
        Some(s) if s.is_finite() => *s,
        _ => 0.0,
    }
}

fn weighted_portion(raw: f64, weight_sum: f64, share: f64) -> f64 {
    if weight_sum > 0.0 {
        raw * share / weight_sum
    } else {
        0.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PanelAggregate {
    pub title_defense_weighted: f64,
    pub individual_weighted: BTreeMap<String, f64>,
}

impl PanelAggregate {
    pub fn individual_for(&self, student_id: &str) -> f64 {
        self.individual_weighted
            .get(student_id)
            .copied()
            .unwrap_or(0.0)
    }
}

/// Reduce one panel's raw rubric scores to weighted sub-totals.
///
/// Missing scores count as 0 and absent grades produce all zeros, so a
/// partially graded sheet still yields a number for every proponent.
pub fn aggregate(
    rubric: &Rubric,
    policy: &GradingPolicy,
    grades: Option<&PanelGrades>,
    proponents: &[Student],
) -> PanelAggregate {
    let Some(grades) = grades else {
        return PanelAggregate {
            title_defense_weighted: 0.0,
            individual_weighted: proponents.iter().map(|p| (p.id.clone(), 0.0)).collect(),
        };
    };

    let title_raw: f64 = rubric
        .title_defense
        .iter()
        .map(|item| score_or_zero(grades.title_defense_scores.get(&item.id)))
        .sum();
    let title_defense_weighted = weighted_portion(
        title_raw,
        rubric.title_defense_weight(),
        policy.title_defense_share,
    );

    let individual_weight = rubric.individual_weight();
    let mut individual_weighted = BTreeMap::new();
    for p in proponents {
        let raw: f64 = match grades.individual_scores.get(&p.id) {
            Some(scores) => rubric
                .individual
                .iter()
                .map(|item| score_or_zero(scores.get(&item.id)))
                .sum(),
            None => 0.0,
        };
        individual_weighted.insert(
            p.id.clone(),
            weighted_portion(raw, individual_weight, policy.individual_share),
        );
    }

    PanelAggregate {
        title_defense_weighted,
        individual_weighted,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentFinal {
    pub student_id: String,
    pub name: String,
    pub p1_title: f64,
    pub p1_indiv: f64,
    pub p2_title: f64,
    pub p2_indiv: f64,
    pub final_score: f64,
}

impl StudentFinal {
    pub fn panel_total(&self, slot: PanelSlot) -> f64 {
        match slot {
            PanelSlot::Panel1 => self.p1_title + self.p1_indiv,
            PanelSlot::Panel2 => self.p2_title + self.p2_indiv,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SheetFinal {
    pub per_student: Vec<StudentFinal>,
    pub group_final_score: f64,
}

/// Combine both panels into per-student and group scores.
///
/// The average is taken whether or not either panel has submitted; callers
/// decide whether a provisional number is shown.
pub fn finalize(rubric: &Rubric, policy: &GradingPolicy, sheet: &GradeSheet) -> SheetFinal {
    let p1 = aggregate(rubric, policy, sheet.panel1_grades.as_ref(), &sheet.proponents);
    let p2 = aggregate(rubric, policy, sheet.panel2_grades.as_ref(), &sheet.proponents);

    let per_student: Vec<StudentFinal> = sheet
        .proponents
        .iter()
        .map(|s| {
            let p1_title = p1.title_defense_weighted;
            let p1_indiv = p1.individual_for(&s.id);
            let p2_title = p2.title_defense_weighted;
            let p2_indiv = p2.individual_for(&s.id);
            StudentFinal {
                student_id: s.id.clone(),
                name: s.name.clone(),
                p1_title,
                p1_indiv,
                p2_title,
                p2_indiv,
                final_score: ((p1_title + p1_indiv) + (p2_title + p2_indiv)) / 2.0,
            }
        })
        .collect();

    let sum: f64 = per_student.iter().map(|s| s.final_score).sum();
    let count = per_student.len().max(1);
    SheetFinal {
        group_final_score: sum / (count as f64),
        per_student,
    }
}

/// Lifecycle label for a pair of panel grade slots. Memoryless: the result
/// depends only on the current contents.
pub fn derive_status(
    panel1: Option<&PanelGrades>,
    panel2: Option<&PanelGrades>,
) -> GradeSheetStatus {
    let p1_submitted = panel1.map(|g| g.submitted).unwrap_or(false);
    let p2_submitted = panel2.map(|g| g.submitted).unwrap_or(false);

    if p1_submitted && p2_submitted {
        GradeSheetStatus::Completed
    } else if p1_submitted {
        GradeSheetStatus::Panel1Submitted
    } else if p2_submitted {
        GradeSheetStatus::Panel2Submitted
    } else if panel1.map(PanelGrades::has_entries).unwrap_or(false)
        || panel2.map(PanelGrades::has_entries).unwrap_or(false)
    {
        GradeSheetStatus::InProgress
    } else {
        GradeSheetStatus::NotStarted
    }
}

/// Pass/fail remark; only completed sheets get one.
pub fn classify(rubric: &Rubric, policy: &GradingPolicy, sheet: &GradeSheet) -> Option<Remark> {
    if sheet.status != GradeSheetStatus::Completed {
        return None;
    }
    let fin = finalize(rubric, policy, sheet);
    if fin.group_final_score < policy.passing_score {
        Some(Remark::Failed)
    } else {
        Some(Remark::Passed)
    }
}

/// Score keys a panel still has to fill before it may submit, formatted as
/// `title:<item>` and `individual:<student>:<item>`.
pub fn missing_scores(
    rubric: &Rubric,
    grades: Option<&PanelGrades>,
    proponents: &[Student],
) -> Vec<String> {
    let mut missing = Vec::new();
    for item in &rubric.title_defense {
        let present = grades
            .and_then(|g| g.title_defense_scores.get(&item.id))
            .map(|v| v.is_finite())
            .unwrap_or(false);
        if !present {
            missing.push(format!("title:{}", item.id));
        }
    }
    for p in proponents {
        let scores = grades.and_then(|g| g.individual_scores.get(&p.id));
        for item in &rubric.individual {
            let present = scores
                .and_then(|m| m.get(&item.id))
                .map(|v| v.is_finite())
                .unwrap_or(false);
            if !present {
                missing.push(format!("individual:{}:{}", p.id, item.id));
            }
        }
    }
    missing
}
