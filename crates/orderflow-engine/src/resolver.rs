use orderflow_core::{non_empty, StepUpdate};

/// Known backend tool labels followed by partial keywords, in priority order.
/// Exact labels are tried case-sensitively, then case-insensitively; the whole
/// table is then scanned for substring matches, so keywords that overlap
/// (`order` inside `order_extraction`) must come after the more specific ones.
pub const DEFAULT_TOOL_RULES: &[(&str, &str)] = &[
    ("OrderExtractionTool", "extraction"),
    ("order_extraction_tool", "extraction"),
    ("Order Extraction Tool", "extraction"),
    ("ValidatorTool", "validation"),
    ("validator_tool", "validation"),
    ("Merge Fields Tool", "merge"),
    ("merge_fields_tool", "merge"),
    ("Inventory Check Tool", "inventory"),
    ("inventory_tool", "inventory"),
    ("Pricing Calculator", "pricing"),
    ("pricing_tool", "pricing"),
    ("Supplier Quote Tool", "supplier"),
    ("supplier_tool", "supplier"),
    ("LogisticsShippingTool", "logistics"),
    ("logistics_tool", "logistics"),
    ("DistanceCalculatorTool", "logistics"),
    ("distance_calculator_tool", "logistics"),
    ("Finance & Payment Tool", "finance"),
    ("finance_tool", "finance"),
    ("StripePaymentTool", "payment"),
    ("stripe_payment_tool", "payment"),
    ("Order Tool", "order"),
    ("order_tool", "order"),
    ("Blockchain Anchor Tool", "blockchain"),
    ("blockchain:anchor", "blockchain"),
    ("portia:google:gmail:send_email", "email"),
    ("plan", "planning"),
    ("extract", "extraction"),
    ("valid", "validation"),
    ("merge", "merge"),
    ("inventor", "inventory"),
    ("stock", "inventory"),
    ("pric", "pricing"),
    ("supplier", "supplier"),
    ("quote", "supplier"),
    ("logistic", "logistics"),
    ("shipping", "logistics"),
    ("distance", "logistics"),
    ("financ", "finance"),
    ("gmail", "email"),
    ("email", "email"),
    ("confirm", "confirmation"),
    ("stripe", "payment"),
    ("payment", "payment"),
    ("checkout", "payment"),
    ("blockchain", "blockchain"),
    ("anchor", "blockchain"),
    ("order", "order"),
];

/// Inputs shorter than this never match as a substring of a table key.
const MIN_REVERSE_MATCH_LEN: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolRule {
    pub label: String,
    pub canonical: String,
}

impl ToolRule {
    pub fn new(label: impl Into<String>, canonical: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            canonical: canonical.into(),
        }
    }
}

/// The labels a raw step update may be identified by.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawStepIdentity<'a> {
    pub id: Option<&'a str>,
    pub tool_name: Option<&'a str>,
    pub name: Option<&'a str>,
}

impl<'a> RawStepIdentity<'a> {
    pub fn tool(tool_name: &'a str) -> Self {
        Self {
            tool_name: Some(tool_name),
            ..Self::default()
        }
    }
}

impl<'a> From<&'a StepUpdate> for RawStepIdentity<'a> {
    fn from(update: &'a StepUpdate) -> Self {
        Self {
            id: update.raw_id.as_deref(),
            tool_name: update.tool_name.as_deref(),
            name: update.name.as_deref(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StepIdentityResolver {
    rules: Vec<ToolRule>,
    lowered: Vec<String>,
}

impl Default for StepIdentityResolver {
    fn default() -> Self {
        Self::with_rules(
            DEFAULT_TOOL_RULES
                .iter()
                .map(|(label, canonical)| ToolRule::new(*label, *canonical))
                .collect(),
        )
    }
}

impl StepIdentityResolver {
    pub fn with_rules(rules: Vec<ToolRule>) -> Self {
        let lowered = rules.iter().map(|rule| rule.label.to_lowercase()).collect();
        Self { rules, lowered }
    }

    /// Adds a rule with lowest priority.
    pub fn push_rule(&mut self, rule: ToolRule) {
        self.lowered.push(rule.label.to_lowercase());
        self.rules.push(rule);
    }

    pub fn rules(&self) -> &[ToolRule] {
        &self.rules
    }

    /// Map a raw identity to a canonical step id. `None` only when every label
    /// is missing or blank.
    pub fn resolve(&self, raw: &RawStepIdentity<'_>) -> Option<String> {
        let tool_name = non_empty(raw.tool_name);
        let name = non_empty(raw.name);
        let id = non_empty(raw.id);

        if let Some(tool) = tool_name.as_deref() {
            if let Some(rule) = self.rules.iter().find(|rule| rule.label == tool) {
                return Some(rule.canonical.clone());
            }
            let lowered_tool = tool.to_lowercase();
            if let Some(idx) = self.lowered.iter().position(|label| *label == lowered_tool) {
                return Some(self.rules[idx].canonical.clone());
            }
        }

        let haystack = [id.as_deref(), name.as_deref(), tool_name.as_deref()]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase();
        if !haystack.is_empty() {
            let matched = self
                .lowered
                .iter()
                .position(|label| haystack.contains(label.as_str()))
                .or_else(|| {
                    if haystack.len() < MIN_REVERSE_MATCH_LEN {
                        return None;
                    }
                    self.lowered.iter().position(|label| label.contains(&haystack))
                });
            if let Some(idx) = matched {
                return Some(self.rules[idx].canonical.clone());
            }
        }

        tool_name
            .as_deref()
            .or(name.as_deref())
            .or(id.as_deref())
            .and_then(fallback_id)
    }

    pub fn resolve_update(&self, update: &StepUpdate) -> Option<String> {
        self.resolve(&RawStepIdentity::from(update))
    }

    /// Resolve a single free-form label (tool name, step name or stage id).
    pub fn resolve_label(&self, label: &str) -> Option<String> {
        self.resolve(&RawStepIdentity::tool(label))
    }
}

/// Lower-case and collapse every non-alphanumeric run into one `_`.
pub fn fallback_id(label: &str) -> Option<String> {
    let mut out = String::with_capacity(label.len());
    let mut pending_sep = false;
    for ch in label.chars() {
        if ch.is_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.extend(ch.to_lowercase());
        } else {
            pending_sep = true;
        }
    }
    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}
