use serde::Serialize;
use std::sync::OnceLock;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RubricLevel {
    pub range: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RubricItem {
    pub id: String,
    pub criteria: String,
    pub weight: f64,
    pub levels: Vec<RubricLevel>,
}

/// Both scoring catalogs used on a grade sheet.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Rubric {
    pub title_defense: Vec<RubricItem>,
    pub individual: Vec<RubricItem>,
}

impl Rubric {
    pub fn title_defense_weight(&self) -> f64 {
        weight_sum(&self.title_defense)
    }

    pub fn individual_weight(&self) -> f64 {
        weight_sum(&self.individual)
    }

    pub fn title_item(&self, id: &str) -> Option<&RubricItem> {
        self.title_defense.iter().find(|i| i.id == id)
    }

    pub fn individual_item(&self, id: &str) -> Option<&RubricItem> {
        self.individual.iter().find(|i| i.id == id)
    }
}

pub fn weight_sum(items: &[RubricItem]) -> f64 {
    items.iter().map(|i| i.weight).sum()
}

// Band lower bounds as fractions of the item weight, lowest band first.
const BAND_FLOORS: [f64; 4] = [0.0, 0.5, 0.75, 0.9];

struct ItemDef {
    id: &'static str,
    criteria: &'static str,
    weight: u32,
    bands: [&'static str; 4],
}

const TITLE_DEFENSE: &[ItemDef] = &[
    ItemDef {
        id: "td_relevance",
        criteria: "Relevance and Significance of the Study",
        weight: 15,
        bands: [
            "Topic has no clear connection to the program or to an existing need.",
            "Topic is related to the program but its benefit is vaguely stated.",
            "Topic addresses a real need and identifies its beneficiaries.",
            "Topic addresses a pressing need with clearly argued, measurable benefits.",
        ],
    },
    ItemDef {
        id: "td_problem",
        criteria: "Statement of the Problem and Objectives",
        weight: 20,
        bands: [
            "Problem is not defined; objectives are missing or unrelated.",
            "Problem is stated but objectives are broad or not measurable.",
            "Problem is clear and most objectives are specific and measurable.",
            "Problem is precise and every objective is specific, measurable and attainable.",
        ],
    },
    ItemDef {
        id: "td_scope",
        criteria: "Scope and Limitations",
        weight: 10,
        bands: [
            "Boundaries of the study are not stated.",
            "Scope is listed but limitations are missing or unrealistic.",
            "Scope and limitations are stated and mostly consistent with the objectives.",
            "Scope and limitations are explicit, realistic and justified.",
        ],
    },
    ItemDef {
        id: "td_literature",
        criteria: "Review of Related Literature and Systems",
        weight: 15,
        bands: [
            "Few or no sources; existing systems are not examined.",
            "Sources are cited but are dated or only loosely related.",
            "Relevant, recent sources are synthesized and compared with the proposal.",
            "Thorough synthesis that clearly positions the proposal against prior work.",
        ],
    },
    ItemDef {
        id: "td_methodology",
        criteria: "Methodology and Technical Feasibility",
        weight: 25,
        bands: [
            "Approach is missing or cannot deliver the objectives.",
            "Approach is described but tools, data or schedule are unrealistic.",
            "Approach is sound and feasible with minor gaps in design or evaluation.",
            "Approach is complete, feasible and includes a credible evaluation plan.",
        ],
    },
    ItemDef {
        id: "td_presentation",
        criteria: "Quality of Presentation and Documentation",
        weight: 15,
        bands: [
            "Slides and manuscript are disorganized with frequent errors.",
            "Material is understandable but inconsistent in format or language.",
            "Material is well organized with few errors.",
            "Material is polished, well paced and follows the prescribed format.",
        ],
    },
];

const INDIVIDUAL: &[ItemDef] = &[
    ItemDef {
        id: "ip_mastery",
        criteria: "Mastery of the Subject Matter",
        weight: 35,
        bands: [
            "Cannot explain the proposal beyond reading prepared material.",
            "Explains own part with frequent reliance on notes.",
            "Explains the proposal confidently with minor gaps.",
            "Demonstrates full command of the proposal and its technical basis.",
        ],
    },
    ItemDef {
        id: "ip_answers",
        criteria: "Ability to Answer Panel Questions",
        weight: 30,
        bands: [
            "Questions are left unanswered or answered incorrectly.",
            "Answers are partially correct or evasive.",
            "Answers are correct and mostly direct.",
            "Answers are correct, direct and supported with evidence.",
        ],
    },
    ItemDef {
        id: "ip_delivery",
        criteria: "Oral Delivery and Communication",
        weight: 20,
        bands: [
            "Delivery is inaudible or difficult to follow.",
            "Delivery is audible but hesitant or monotonous.",
            "Delivery is clear with good pacing.",
            "Delivery is clear, engaging and well timed.",
        ],
    },
    ItemDef {
        id: "ip_conduct",
        criteria: "Professional Conduct and Preparedness",
        weight: 15,
        bands: [
            "Unprepared or unprofessional during the defense.",
            "Somewhat prepared; attire or conduct needs improvement.",
            "Prepared and professional throughout.",
            "Exemplary preparation, attire and courtesy toward the panel.",
        ],
    },
];

fn band_ranges(weight: u32) -> [String; 4] {
    let w = f64::from(weight);
    let lows: Vec<u32> = BAND_FLOORS
        .iter()
        .map(|f| (w * f).ceil() as u32)
        .collect();
    let mut out: [String; 4] = Default::default();
    for (i, lo) in lows.iter().enumerate() {
        let hi = lows
            .get(i + 1)
            .map(|next| next.saturating_sub(1))
            .unwrap_or(weight);
        out[i] = if *lo >= hi {
            lo.to_string()
        } else {
            format!("{}-{}", lo, hi)
        };
    }
    out
}

fn build_items(defs: &[ItemDef]) -> Vec<RubricItem> {
    defs.iter()
        .map(|d| {
            let ranges = band_ranges(d.weight);
            RubricItem {
                id: d.id.to_string(),
                criteria: d.criteria.to_string(),
                weight: f64::from(d.weight),
                levels: ranges
                    .into_iter()
                    .zip(d.bands.iter())
                    .map(|(range, description)| RubricLevel {
                        range,
                        description: description.to_string(),
                    })
                    .collect(),
            }
        })
        .collect()
}

/// The catalog every grade sheet is scored against.
pub fn standard() -> &'static Rubric {
    static STANDARD: OnceLock<Rubric> = OnceLock::new();
    STANDARD.get_or_init(|| Rubric {
        title_defense: build_items(TITLE_DEFENSE),
        individual: build_items(INDIVIDUAL),
    })
}
