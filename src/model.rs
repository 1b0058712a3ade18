use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Student {
    pub id: String,
    pub name: String,
}

/// One evaluator's scores for one grade sheet.
///
/// `individual_scores` is keyed by student id, then rubric item id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PanelGrades {
    #[serde(default)]
    pub title_defense_scores: BTreeMap<String, f64>,
    #[serde(default)]
    pub individual_scores: BTreeMap<String, BTreeMap<String, f64>>,
    #[serde(default)]
    pub comments: String,
    #[serde(default)]
    pub submitted: bool,
}

impl PanelGrades {
    /// True once anything beyond the empty template has been entered.
    pub fn has_entries(&self) -> bool {
        !self.title_defense_scores.is_empty()
            || !self.individual_scores.is_empty()
            || !self.comments.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GradeSheetStatus {
    #[serde(rename = "NOT_STARTED")]
    NotStarted,
    #[serde(rename = "IN_PROGRESS")]
    InProgress,
    #[serde(rename = "PANEL_1_SUBMITTED")]
    Panel1Submitted,
    #[serde(rename = "PANEL_2_SUBMITTED")]
    Panel2Submitted,
    #[serde(rename = "COMPLETED")]
    Completed,
}

impl GradeSheetStatus {
    pub const ALL: [GradeSheetStatus; 5] = [
        GradeSheetStatus::NotStarted,
        GradeSheetStatus::InProgress,
        GradeSheetStatus::Panel1Submitted,
        GradeSheetStatus::Panel2Submitted,
        GradeSheetStatus::Completed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            GradeSheetStatus::NotStarted => "NOT_STARTED",
            GradeSheetStatus::InProgress => "IN_PROGRESS",
            GradeSheetStatus::Panel1Submitted => "PANEL_1_SUBMITTED",
            GradeSheetStatus::Panel2Submitted => "PANEL_2_SUBMITTED",
            GradeSheetStatus::Completed => "COMPLETED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|st| st.as_str().eq_ignore_ascii_case(s.trim()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PanelSlot {
    Panel1,
    Panel2,
}

impl PanelSlot {
    pub fn as_str(self) -> &'static str {
        match self {
            PanelSlot::Panel1 => "panel1",
            PanelSlot::Panel2 => "panel2",
        }
    }

    pub fn other(self) -> Self {
        match self {
            PanelSlot::Panel1 => PanelSlot::Panel2,
            PanelSlot::Panel2 => PanelSlot::Panel1,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "panel1" | "1" => Some(PanelSlot::Panel1),
            "panel2" | "2" => Some(PanelSlot::Panel2),
            _ => None,
        }
    }
}

impl fmt::Display for PanelSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeSheet {
    pub id: String,
    pub group_name: String,
    pub proponents: Vec<Student>,
    pub panel1_id: Option<String>,
    pub panel2_id: Option<String>,
    pub panel1_grades: Option<PanelGrades>,
    pub panel2_grades: Option<PanelGrades>,
    pub status: GradeSheetStatus,
    pub version: i64,
    pub created_at: String,
    pub updated_at: String,
}

impl GradeSheet {
    pub fn panel_id(&self, slot: PanelSlot) -> Option<&str> {
        match slot {
            PanelSlot::Panel1 => self.panel1_id.as_deref(),
            PanelSlot::Panel2 => self.panel2_id.as_deref(),
        }
    }

    pub fn grades(&self, slot: PanelSlot) -> Option<&PanelGrades> {
        match slot {
            PanelSlot::Panel1 => self.panel1_grades.as_ref(),
            PanelSlot::Panel2 => self.panel2_grades.as_ref(),
        }
    }

    pub fn grades_mut(&mut self, slot: PanelSlot) -> &mut Option<PanelGrades> {
        match slot {
            PanelSlot::Panel1 => &mut self.panel1_grades,
            PanelSlot::Panel2 => &mut self.panel2_grades,
        }
    }

    /// Slot held by `user_id`, if any. Panel 1 wins if both point at the same
    /// user, which the store never persists.
    pub fn slot_of(&self, user_id: &str) -> Option<PanelSlot> {
        if self.panel1_id.as_deref() == Some(user_id) {
            Some(PanelSlot::Panel1)
        } else if self.panel2_id.as_deref() == Some(user_id) {
            Some(PanelSlot::Panel2)
        } else {
            None
        }
    }

    pub fn is_submitted(&self, slot: PanelSlot) -> bool {
        self.grades(slot).map(|g| g.submitted).unwrap_or(false)
    }

    /// Copy of the sheet as the evaluator in `viewer` may see it. The other
    /// slot's grades stay hidden until that evaluator submits.
    pub fn redacted_for(&self, viewer: PanelSlot) -> GradeSheet {
        let mut out = self.clone();
        let other = viewer.other();
        if !out.is_submitted(other) {
            *out.grades_mut(other) = None;
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Panel,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Panel => "panel",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin" => Some(Role::Admin),
            "panel" => Some(Role::Panel),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub username: String,
    pub display_name: String,
    pub role: Role,
    pub active: bool,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Remark {
    Passed,
    Failed,
}

impl Remark {
    pub fn as_str(self) -> &'static str {
        match self {
            Remark::Passed => "Passed",
            Remark::Failed => "Failed",
        }
    }
}
