//! Plan catalog.
//!
//! Maps each [`PlanId`] to its quotas and module flags. The catalog is built
//! once at startup and shared by reference; nothing here is global.
//!
//! ```rust,ignore
//! use clinify_billing::billing::{PlanCatalog, PlanId, Module};
//!
//! let catalog = PlanCatalog::standard();
//! let basic = catalog.get(PlanId::Basic);
//! assert_eq!(basic.limits.max_patients, 200);
//! assert!(basic.modules.get(Module::Prescriptions).is_enabled());
//! ```

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Quota value meaning "no limit".
pub const UNLIMITED: i64 = -1;

/// Subscription tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanId {
    Free,
    Basic,
    Professional,
    Enterprise,
}

impl PlanId {
    /// All plans, cheapest first.
    pub const ALL: [PlanId; 4] = [
        PlanId::Free,
        PlanId::Basic,
        PlanId::Professional,
        PlanId::Enterprise,
    ];

    /// Plans that are billed through a provider.
    pub const PAID: [PlanId; 3] = [PlanId::Basic, PlanId::Professional, PlanId::Enterprise];

    /// Parse a plan identifier. Unknown values fall back to `Free`.
    #[must_use]
    pub fn parse_lossy(value: &str) -> Self {
        value.parse().unwrap_or(Self::Free)
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Basic => "basic",
            Self::Professional => "professional",
            Self::Enterprise => "enterprise",
        }
    }

    #[must_use]
    pub fn is_paid(&self) -> bool {
        !matches!(self, Self::Free)
    }
}

impl std::str::FromStr for PlanId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(Self::Free),
            "basic" => Ok(Self::Basic),
            "professional" => Ok(Self::Professional),
            "enterprise" => Ok(Self::Enterprise),
            other => Err(format!("unknown plan: {}", other)),
        }
    }
}

impl fmt::Display for PlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Access level for a feature module.
///
/// Serialized as `false`, `true`, `"basic"` or `"advanced"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleAccess {
    Disabled,
    Enabled,
    Basic,
    Advanced,
}

impl ModuleAccess {
    /// Any access at all.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        !matches!(self, Self::Disabled)
    }

    /// Full access. A plain `true` flag has no tiers and counts as full.
    #[must_use]
    pub fn is_advanced(&self) -> bool {
        matches!(self, Self::Advanced | Self::Enabled)
    }
}

impl Serialize for ModuleAccess {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Disabled => serializer.serialize_bool(false),
            Self::Enabled => serializer.serialize_bool(true),
            Self::Basic => serializer.serialize_str("basic"),
            Self::Advanced => serializer.serialize_str("advanced"),
        }
    }
}

impl<'de> Deserialize<'de> for ModuleAccess {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Flag(bool),
            Tier(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Flag(true) => Ok(Self::Enabled),
            Raw::Flag(false) => Ok(Self::Disabled),
            Raw::Tier(tier) => match tier.as_str() {
                "basic" => Ok(Self::Basic),
                "advanced" => Ok(Self::Advanced),
                "false" => Ok(Self::Disabled),
                "true" => Ok(Self::Enabled),
                other => Err(serde::de::Error::custom(format!(
                    "invalid module access: {}",
                    other
                ))),
            },
        }
    }
}

/// Feature area gated per plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Module {
    Finance,
    Patients,
    Appointments,
    Reports,
    Crm,
    Inventory,
    Prescriptions,
    Loyalty,
    Commissions,
    Records,
    Ai,
    WhiteLabel,
    MultiBranch,
    CustomIntegrations,
}

impl Module {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Finance => "finance",
            Self::Patients => "patients",
            Self::Appointments => "appointments",
            Self::Reports => "reports",
            Self::Crm => "crm",
            Self::Inventory => "inventory",
            Self::Prescriptions => "prescriptions",
            Self::Loyalty => "loyalty",
            Self::Commissions => "commissions",
            Self::Records => "records",
            Self::Ai => "ai",
            Self::WhiteLabel => "white_label",
            Self::MultiBranch => "multi_branch",
            Self::CustomIntegrations => "custom_integrations",
        }
    }
}

impl std::str::FromStr for Module {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Accept the camelCase spellings the frontend uses as well.
        match s {
            "finance" => Ok(Self::Finance),
            "patients" => Ok(Self::Patients),
            "appointments" => Ok(Self::Appointments),
            "reports" => Ok(Self::Reports),
            "crm" => Ok(Self::Crm),
            "inventory" => Ok(Self::Inventory),
            "prescriptions" => Ok(Self::Prescriptions),
            "loyalty" => Ok(Self::Loyalty),
            "commissions" => Ok(Self::Commissions),
            "records" => Ok(Self::Records),
            "ai" => Ok(Self::Ai),
            "white_label" | "whiteLabel" => Ok(Self::WhiteLabel),
            "multi_branch" | "multiBranch" => Ok(Self::MultiBranch),
            "custom_integrations" | "customIntegrations" => Ok(Self::CustomIntegrations),
            other => Err(format!("unknown module: {}", other)),
        }
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Quota-bounded resource kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Counted over all time.
    Patient,
    /// Staff seats, counted over all time.
    User,
    /// Counted per calendar month by creation time.
    Transaction,
    /// Counted per calendar month by start time.
    Appointment,
}

impl ResourceKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Patient => "patient",
            Self::User => "user",
            Self::Transaction => "transaction",
            Self::Appointment => "appointment",
        }
    }

    /// Whether usage resets every calendar month.
    #[must_use]
    pub fn is_monthly(&self) -> bool {
        matches!(self, Self::Transaction | Self::Appointment)
    }
}

impl std::str::FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "patient" | "patients" => Ok(Self::Patient),
            "user" | "users" => Ok(Self::User),
            "transaction" | "transactions" => Ok(Self::Transaction),
            "appointment" | "appointments" => Ok(Self::Appointment),
            other => Err(format!("unknown resource: {}", other)),
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Numeric quotas for a plan. [`UNLIMITED`] (-1) disables a quota.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanLimits {
    pub max_patients: i64,
    pub max_users: i64,
    pub max_appointments_per_month: i64,
    pub max_transactions_per_month: i64,
}

impl PlanLimits {
    /// Limits with every quota disabled.
    #[must_use]
    pub fn unlimited() -> Self {
        Self {
            max_patients: UNLIMITED,
            max_users: UNLIMITED,
            max_appointments_per_month: UNLIMITED,
            max_transactions_per_month: UNLIMITED,
        }
    }

    /// The quota for a resource kind.
    #[must_use]
    pub fn get(&self, resource: ResourceKind) -> i64 {
        match resource {
            ResourceKind::Patient => self.max_patients,
            ResourceKind::User => self.max_users,
            ResourceKind::Appointment => self.max_appointments_per_month,
            ResourceKind::Transaction => self.max_transactions_per_month,
        }
    }

    /// Check current usage against the quota for `resource`.
    ///
    /// The comparison is strict: reaching the limit blocks the next creation.
    #[must_use]
    pub fn check(&self, resource: ResourceKind, current: i64) -> LimitCheckResult {
        match self.get(resource) {
            max if max < 0 => LimitCheckResult::Unlimited { current },
            max if current < max => LimitCheckResult::WithinLimit { current, max },
            max => LimitCheckResult::AtLimit { current, max },
        }
    }
}

/// Result of checking a resource limit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LimitCheckResult {
    /// No limit on this resource.
    Unlimited { current: i64 },
    /// Usage is below the limit.
    WithinLimit { current: i64, max: i64 },
    /// Usage has reached or exceeded the limit.
    AtLimit { current: i64, max: i64 },
}

impl LimitCheckResult {
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Unlimited { .. } | Self::WithinLimit { .. })
    }

    #[must_use]
    pub fn is_at_limit(&self) -> bool {
        matches!(self, Self::AtLimit { .. })
    }

    #[must_use]
    pub fn current(&self) -> i64 {
        match self {
            Self::Unlimited { current }
            | Self::WithinLimit { current, .. }
            | Self::AtLimit { current, .. } => *current,
        }
    }

    /// The limit, or [`UNLIMITED`].
    #[must_use]
    pub fn limit(&self) -> i64 {
        match self {
            Self::Unlimited { .. } => UNLIMITED,
            Self::WithinLimit { max, .. } | Self::AtLimit { max, .. } => *max,
        }
    }
}

/// Module flags for a plan.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanModules {
    pub finance: ModuleAccess,
    pub patients: ModuleAccess,
    pub appointments: ModuleAccess,
    pub reports: ModuleAccess,
    pub crm: ModuleAccess,
    pub inventory: ModuleAccess,
    pub prescriptions: ModuleAccess,
    pub loyalty: ModuleAccess,
    pub commissions: ModuleAccess,
    pub records: ModuleAccess,
    pub ai: ModuleAccess,
    pub white_label: ModuleAccess,
    pub multi_branch: ModuleAccess,
    pub custom_integrations: ModuleAccess,
}

impl PlanModules {
    #[must_use]
    pub fn get(&self, module: Module) -> ModuleAccess {
        match module {
            Module::Finance => self.finance,
            Module::Patients => self.patients,
            Module::Appointments => self.appointments,
            Module::Reports => self.reports,
            Module::Crm => self.crm,
            Module::Inventory => self.inventory,
            Module::Prescriptions => self.prescriptions,
            Module::Loyalty => self.loyalty,
            Module::Commissions => self.commissions,
            Module::Records => self.records,
            Module::Ai => self.ai,
            Module::WhiteLabel => self.white_label,
            Module::MultiBranch => self.multi_branch,
            Module::CustomIntegrations => self.custom_integrations,
        }
    }
}

/// Quotas and module flags for one plan.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanDefinition {
    pub id: PlanId,
    pub display_name: String,
    pub limits: PlanLimits,
    pub modules: PlanModules,
}

/// Immutable plan catalog.
///
/// Every [`PlanId`] resolves to a definition: plans missing from a custom
/// catalog fall back to the `free` definition.
#[derive(Clone, Debug)]
pub struct PlanCatalog {
    plans: HashMap<PlanId, PlanDefinition>,
    fallback: PlanDefinition,
}

impl PlanCatalog {
    /// The Clinify plan table.
    #[must_use]
    pub fn standard() -> Self {
        use ModuleAccess::{Advanced, Basic, Disabled, Enabled};

        let free = PlanDefinition {
            id: PlanId::Free,
            display_name: "Free".to_string(),
            limits: PlanLimits {
                max_patients: 50,
                max_users: 1,
                max_appointments_per_month: 100,
                max_transactions_per_month: 100,
            },
            modules: PlanModules {
                finance: Basic,
                patients: Enabled,
                appointments: Enabled,
                reports: Disabled,
                crm: Disabled,
                inventory: Disabled,
                prescriptions: Disabled,
                loyalty: Disabled,
                commissions: Disabled,
                records: Basic,
                ai: Disabled,
                white_label: Disabled,
                multi_branch: Disabled,
                custom_integrations: Disabled,
            },
        };

        let basic = PlanDefinition {
            id: PlanId::Basic,
            display_name: "Basic".to_string(),
            limits: PlanLimits {
                max_patients: 200,
                max_users: 3,
                max_appointments_per_month: 500,
                max_transactions_per_month: 500,
            },
            modules: PlanModules {
                finance: Basic,
                reports: Basic,
                inventory: Basic,
                prescriptions: Enabled,
                ..free.modules.clone()
            },
        };

        let professional = PlanDefinition {
            id: PlanId::Professional,
            display_name: "Professional".to_string(),
            limits: PlanLimits {
                max_patients: 1000,
                max_users: 10,
                max_appointments_per_month: UNLIMITED,
                max_transactions_per_month: UNLIMITED,
            },
            modules: PlanModules {
                finance: Advanced,
                reports: Advanced,
                crm: Enabled,
                inventory: Advanced,
                loyalty: Enabled,
                commissions: Enabled,
                records: Advanced,
                ai: Basic,
                ..basic.modules.clone()
            },
        };

        let enterprise = PlanDefinition {
            id: PlanId::Enterprise,
            display_name: "Enterprise".to_string(),
            limits: PlanLimits::unlimited(),
            modules: PlanModules {
                crm: Advanced,
                ai: Advanced,
                white_label: Enabled,
                multi_branch: Enabled,
                custom_integrations: Enabled,
                ..professional.modules.clone()
            },
        };

        Self::from_definitions(vec![free, basic, professional, enterprise])
    }

    /// Build a catalog from explicit definitions.
    ///
    /// The `free` definition is the fallback for plans that are not listed; if
    /// `free` itself is missing, the standard free plan is used.
    #[must_use]
    pub fn from_definitions(definitions: Vec<PlanDefinition>) -> Self {
        let plans: HashMap<PlanId, PlanDefinition> =
            definitions.into_iter().map(|d| (d.id, d)).collect();

        let fallback = match plans.get(&PlanId::Free) {
            Some(free) => free.clone(),
            None => Self::standard().fallback,
        };

        Self { plans, fallback }
    }

    /// Get the definition for a plan.
    #[must_use]
    pub fn get(&self, plan: PlanId) -> &PlanDefinition {
        self.plans.get(&plan).unwrap_or(&self.fallback)
    }

    /// Get the definition for a raw plan string. Unknown plans resolve to `free`.
    #[must_use]
    pub fn get_by_name(&self, plan: &str) -> &PlanDefinition {
        self.get(PlanId::parse_lossy(plan))
    }

    /// Iterate over all definitions, cheapest first.
    pub fn iter(&self) -> impl Iterator<Item = &PlanDefinition> {
        PlanId::ALL.into_iter().map(|id| self.get(id))
    }
}

impl Default for PlanCatalog {
    fn default() -> Self {
        Self::standard()
    }
}
