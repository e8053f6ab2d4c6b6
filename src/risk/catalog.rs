//! Static classification tables: action categories and resource sensitivity.
//!
//! Action names are resolved through an explicit catalog into a closed
//! [`ActionCategory`]; an action missing from the catalog is an error, never a
//! silent default. The category decides the mutation scope fed to the risk
//! scorer and the default capability-token TTL.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

/// Errors from catalog lookups.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ActionError {
    /// The action name is not in the catalog.
    #[error("unknown action: {0}")]
    UnknownAction(String),
}

/// Closed set of action categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionCategory {
    /// Read records.
    Query,
    /// Run rules or checks over records.
    Evaluate,
    /// Compute scores or aggregates.
    Calculate,
    /// Create new records.
    Create,
    /// Modify existing records.
    Update,
    /// Remove records.
    Delete,
    /// Open-ended investigation across records.
    Investigate,
    /// Conversational response.
    Chat,
    /// Hand work to a higher authority.
    Escalate,
}

impl ActionCategory {
    /// Every category, in declaration order.
    pub const ALL: [ActionCategory; 9] = [
        Self::Query,
        Self::Evaluate,
        Self::Calculate,
        Self::Create,
        Self::Update,
        Self::Delete,
        Self::Investigate,
        Self::Chat,
        Self::Escalate,
    ];

    /// Mutation scope this category implies.
    pub fn mutation_scope(self) -> MutationScope {
        match self {
            Self::Query | Self::Evaluate | Self::Calculate | Self::Investigate | Self::Chat => {
                MutationScope::Read
            }
            Self::Create | Self::Update => MutationScope::Write,
            Self::Delete => MutationScope::Delete,
            Self::Escalate => MutationScope::Escalate,
        }
    }

    /// String form used in config files and storage.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::Evaluate => "evaluate",
            Self::Calculate => "calculate",
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Investigate => "investigate",
            Self::Chat => "chat",
            Self::Escalate => "escalate",
        }
    }
}

/// How much an action changes state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationScope {
    /// No state change.
    Read,
    /// Creates or modifies state.
    Write,
    /// Destroys state.
    Delete,
    /// Changes who is responsible for the work.
    Escalate,
}

impl MutationScope {
    /// Risk contribution of this scope before weighting.
    pub fn value(self) -> f64 {
        match self {
            Self::Read => 0.1,
            Self::Write => 0.5,
            Self::Delete => 0.9,
            Self::Escalate => 0.3,
        }
    }
}

/// Five-tier resource sensitivity classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sensitivity {
    /// Publicly available data.
    Public,
    /// Internal operational data.
    Internal,
    /// Business-confidential data.
    Confidential,
    /// Regulated or personal data.
    Restricted,
    /// Highest classification.
    Classified,
}

impl Sensitivity {
    /// Risk contribution of this tier before weighting.
    pub fn value(self) -> f64 {
        match self {
            Self::Public => 0.1,
            Self::Internal => 0.3,
            Self::Confidential => 0.5,
            Self::Restricted => 0.75,
            Self::Classified => 1.0,
        }
    }

    /// Whether touching this tier counts as sensitive-data access.
    pub fn is_sensitive_data(self) -> bool {
        matches!(self, Self::Restricted | Self::Classified)
    }

    /// String form used in config files and storage.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Internal => "internal",
            Self::Confidential => "confidential",
            Self::Restricted => "restricted",
            Self::Classified => "classified",
        }
    }
}

/// Action name → category lookup.
#[derive(Debug, Clone)]
pub struct ActionCatalog {
    actions: HashMap<String, ActionCategory>,
}

impl ActionCatalog {
    /// Build a catalog from explicit entries.
    pub fn new(actions: HashMap<String, ActionCategory>) -> Self {
        Self { actions }
    }

    /// Resolve an action name to its category.
    ///
    /// # Errors
    ///
    /// Returns [`ActionError::UnknownAction`] if the name is not catalogued.
    pub fn resolve(&self, action: &str) -> Result<ActionCategory, ActionError> {
        self.actions
            .get(action)
            .copied()
            .ok_or_else(|| ActionError::UnknownAction(action.to_owned()))
    }

    /// Whether `action` is catalogued.
    pub fn contains(&self, action: &str) -> bool {
        self.actions.contains_key(action)
    }

    /// Number of catalogued actions.
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Whether the catalog is empty.
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

impl Default for ActionCatalog {
    fn default() -> Self {
        Self::new(default_actions())
    }
}

/// Built-in action catalog for the claims/case-management agents.
pub fn default_actions() -> HashMap<String, ActionCategory> {
    use ActionCategory::*;
    [
        ("query_claims", Query),
        ("query_cases", Query),
        ("query_providers", Query),
        ("evaluate_rules", Evaluate),
        ("evaluate_claim", Evaluate),
        ("calculate_score", Calculate),
        ("calculate_exposure", Calculate),
        ("create_case", Create),
        ("create_note", Create),
        ("update_case", Update),
        ("update_claim_status", Update),
        ("bulk_update_claims", Update),
        ("approve_payment", Update),
        ("close_case", Update),
        ("delete_case", Delete),
        ("delete_records", Delete),
        ("purge_data", Delete),
        ("export_data", Query),
        ("investigate_claim", Investigate),
        ("investigate_provider", Investigate),
        ("chat", Chat),
        ("escalate_case", Escalate),
    ]
    .into_iter()
    .map(|(name, category)| (name.to_owned(), category))
    .collect()
}

/// Actions that always need a human, whatever their score.
pub fn default_always_hitl() -> Vec<String> {
    [
        "delete_case",
        "delete_records",
        "purge_data",
        "bulk_update_claims",
        "approve_payment",
        "close_case",
        "export_data",
    ]
    .into_iter()
    .map(str::to_owned)
    .collect()
}

/// Result of classifying a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceClass {
    /// Sensitivity tier.
    pub sensitivity: Sensitivity,
    /// Whether the resource holds protected health information.
    pub phi: bool,
}

/// Resource/tool name → sensitivity classification.
#[derive(Debug, Clone)]
pub struct SensitivityTable {
    tiers: HashMap<String, Sensitivity>,
    phi: HashSet<String>,
    fallback: Sensitivity,
}

impl SensitivityTable {
    /// Build a table; unlisted resources get `fallback`.
    pub fn new(
        tiers: HashMap<String, Sensitivity>,
        phi: HashSet<String>,
        fallback: Sensitivity,
    ) -> Self {
        Self {
            tiers,
            phi,
            fallback,
        }
    }

    /// Classify a resource.
    pub fn classify(&self, resource: &str) -> ResourceClass {
        ResourceClass {
            sensitivity: self.tiers.get(resource).copied().unwrap_or(self.fallback),
            phi: self.phi.contains(resource),
        }
    }

    /// Whether the resource is explicitly listed.
    pub fn is_classified(&self, resource: &str) -> bool {
        self.tiers.contains_key(resource)
    }
}

impl Default for SensitivityTable {
    fn default() -> Self {
        Self::new(
            default_sensitivity(),
            default_phi_resources(),
            Sensitivity::Confidential,
        )
    }
}

/// Built-in sensitivity classification.
pub fn default_sensitivity() -> HashMap<String, Sensitivity> {
    use Sensitivity::*;
    [
        ("public_reference", Public),
        ("rule_catalog", Internal),
        ("dashboard", Internal),
        ("cases", Confidential),
        ("claims", Confidential),
        ("providers", Confidential),
        ("members", Restricted),
        ("medical_records", Restricted),
        ("payments", Restricted),
        ("audit_log", Classified),
        ("investigations", Classified),
    ]
    .into_iter()
    .map(|(name, tier)| (name.to_owned(), tier))
    .collect()
}

/// Resources holding protected health information.
pub fn default_phi_resources() -> HashSet<String> {
    ["members", "medical_records"]
        .into_iter()
        .map(str::to_owned)
        .collect()
}
