use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PlanType {
    #[default]
    Free,
    Pro,
}

impl PlanType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanType::Free => "free",
            PlanType::Pro => "pro",
        }
    }

    pub fn is_pro(&self) -> bool {
        matches!(self, PlanType::Pro)
    }
}

impl FromStr for PlanType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(PlanType::Free),
            "pro" => Ok(PlanType::Pro),
            other => Err(format!("Unknown plan type: {}", other)),
        }
    }
}

impl fmt::Display for PlanType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    Income,
    Expense,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Income => "income",
            TransactionType::Expense => "expense",
        }
    }
}

impl FromStr for TransactionType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "income" => Ok(TransactionType::Income),
            "expense" => Ok(TransactionType::Expense),
            other => Err(format!("Unknown transaction type: {}", other)),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GoalType {
    Income,
    Expense,
    Profit,
}

impl GoalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GoalType::Income => "income",
            GoalType::Expense => "expense",
            GoalType::Profit => "profit",
        }
    }
}

impl FromStr for GoalType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "income" => Ok(GoalType::Income),
            "expense" => Ok(GoalType::Expense),
            "profit" => Ok(GoalType::Profit),
            other => Err(format!("Unknown goal type: {}", other)),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum GoalPeriod {
    #[default]
    Monthly,
    Yearly,
}

impl GoalPeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            GoalPeriod::Monthly => "monthly",
            GoalPeriod::Yearly => "yearly",
        }
    }
}

impl FromStr for GoalPeriod {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "monthly" => Ok(GoalPeriod::Monthly),
            "yearly" => Ok(GoalPeriod::Yearly),
            other => Err(format!("Unknown goal period: {}", other)),
        }
    }
}

/// Resources whose creation is capped for free accounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceType {
    Transactions,
    Clients,
}

impl ResourceType {
    pub fn table(&self) -> &'static str {
        match self {
            ResourceType::Transactions => "transactions",
            ResourceType::Clients => "clients",
        }
    }
}

// ---------------------------------------------------------------------------
// Users and sessions
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct User {
    pub id: String,
    pub email: String,
    pub full_name: Option<String>,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub plan_type: PlanType,
    pub plan_expiry_date: Option<String>,
    #[serde(skip_serializing)]
    pub stripe_customer_id: Option<String>,
}

/// What the session cookie carries; everything else is reloaded from the store.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SessionUser {
    pub id: String,
    pub email: String,
}

#[derive(Deserialize)]
pub struct RegisterPayload {
    pub email: String,
    pub password: String,
    pub full_name: Option<String>,
}

#[derive(Deserialize)]
pub struct LoginPayload {
    pub email: String,
    pub password: String,
}

#[derive(Serialize, Debug)]
pub struct PublicUser {
    pub id: String,
    pub email: String,
    pub full_name: Option<String>,
    pub plan_type: PlanType,
}

impl From<&User> for PublicUser {
    fn from(user: &User) -> Self {
        Self {
            id: user.id.clone(),
            email: user.email.clone(),
            full_name: user.full_name.clone(),
            plan_type: user.plan_type,
        }
    }
}

// ---------------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Transaction {
    pub id: String,
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
    pub amount: f64,
    #[serde(rename = "type")]
    pub transaction_type: TransactionType,
    pub category: String,
    pub description: Option<String>,
    pub date: String,
    pub created_at: i64,
}

#[derive(Deserialize)]
pub struct CreateTransactionPayload {
    pub client_id: Option<String>,
    pub amount: f64,
    #[serde(rename = "type")]
    pub transaction_type: TransactionType,
    pub category: Option<String>,
    pub description: Option<String>,
    pub date: String,
}

/// Partial update. An empty `client_id` detaches the transaction from its client.
#[derive(Deserialize)]
pub struct UpdateTransactionPayload {
    pub client_id: Option<String>,
    pub amount: Option<f64>,
    #[serde(rename = "type")]
    pub transaction_type: Option<TransactionType>,
    pub category: Option<String>,
    pub description: Option<String>,
    pub date: Option<String>,
}

#[derive(Deserialize)]
pub struct GetTransactionsQuery {
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    #[serde(rename = "type")]
    pub transaction_type: Option<TransactionType>,
    pub client_id: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Serialize)]
pub struct GetTransactionsResponse {
    pub transactions: Vec<Transaction>,
    pub total_count: u32,
}

// ---------------------------------------------------------------------------
// Clients
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Client {
    pub id: String,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub created_at: i64,
}

#[derive(Deserialize)]
pub struct CreateClientPayload {
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
}

#[derive(Deserialize)]
pub struct UpdateClientPayload {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
}

#[derive(Deserialize)]
pub struct GetClientsQuery {
    pub limit: Option<u32>,
    pub offset: Option<u32>,
    pub search: Option<String>,
}

#[derive(Serialize)]
pub struct GetClientsResponse {
    pub clients: Vec<Client>,
    pub total_count: u32,
    pub limit: u32,
    pub offset: u32,
}

// ---------------------------------------------------------------------------
// Goals
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Goal {
    pub id: String,
    #[serde(rename = "type")]
    pub goal_type: GoalType,
    pub category: Option<String>,
    pub target_amount: f64,
    pub current_amount: f64,
    pub period: GoalPeriod,
    pub description: String,
    pub created_at: i64,
}

#[derive(Deserialize)]
pub struct CreateGoalPayload {
    #[serde(rename = "type")]
    pub goal_type: GoalType,
    pub category: Option<String>,
    pub target_amount: f64,
    pub period: Option<GoalPeriod>,
    pub description: Option<String>,
}

#[derive(Deserialize)]
pub struct UpdateGoalPayload {
    pub category: Option<String>,
    pub target_amount: Option<f64>,
    pub period: Option<GoalPeriod>,
    pub description: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GoalStatus {
    // expense goals
    Comfortable,
    WithinBudget,
    NearLimit,
    OverBudget,
    // income and profit goals
    Met,
    OnTrack,
    Behind,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct GoalProgress {
    pub goal: Goal,
    pub current: f64,
    pub percentage: f64,
    pub status: GoalStatus,
}

#[derive(Serialize, Debug)]
pub struct GoalsProgressResponse {
    pub goals: Vec<GoalProgress>,
    pub recommendations: Vec<String>,
}

// ---------------------------------------------------------------------------
// Plan gating and reports
// ---------------------------------------------------------------------------

/// Rolling seven-day creation quota. `limit` is `None` when unbounded.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeeklyLimit {
    pub count: u32,
    pub limit: Option<u32>,
    pub can_create: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct SubscriptionStatus {
    pub subscribed: bool,
    pub plan_type: PlanType,
    pub plan_expiry_date: Option<String>,
    pub is_loading: bool,
    pub error: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MonthlyTotal {
    pub month: String,
    pub income: f64,
    pub expense: f64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CategoryTotal {
    pub name: String,
    pub value: f64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TopMonth {
    pub month: String,
    pub profit: f64,
    pub income: f64,
    pub expense: f64,
}

/// Current-month totals used by goals and the dashboard.
#[derive(Serialize, Debug, Clone, PartialEq, Default)]
pub struct MonthStats {
    pub total_income: f64,
    pub total_expense: f64,
    pub total_profit: f64,
    pub expenses_by_category: BTreeMap<String, f64>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ReportSummary {
    pub plan_type: PlanType,
    pub monthly: Vec<MonthlyTotal>,
    pub category_breakdown: Vec<CategoryTotal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_months: Option<Vec<TopMonth>>,
}

#[derive(Serialize, Debug)]
pub struct DashboardSummary {
    pub total_income: f64,
    pub total_expense: f64,
    pub balance: f64,
    pub recent_transactions: Vec<Transaction>,
    pub weekly_limit: WeeklyLimit,
    pub accounts_receivable: f64,
    pub accounts_payable: f64,
}

#[derive(Deserialize)]
pub struct DashboardQuery {
    pub checkout: Option<String>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct UrlResponse {
    pub url: String,
}

// ---------------------------------------------------------------------------
// Password recovery
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct SecuritySetupPayload {
    pub question: String,
    pub answer: String,
    pub fake_answers: Vec<String>,
}

#[derive(Deserialize)]
pub struct RecoveryQuestionPayload {
    pub email: String,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct RecoveryQuestionResponse {
    pub question: String,
    pub options: Vec<String>,
}

#[derive(Deserialize)]
pub struct RecoveryAnswerPayload {
    pub email: String,
    pub answer: String,
}

#[derive(Deserialize)]
pub struct ResetPasswordPayload {
    pub token: String,
    pub new_password: String,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct MessageResponse {
    pub message: String,
}
