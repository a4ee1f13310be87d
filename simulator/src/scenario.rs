//! Simulation scenarios.

use serde::{Deserialize, Serialize};

/// A customer known to the directory for the scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerSpec {
    pub name: String,
    /// Internal serial seeding the customer's account numbers.
    pub serial: i64,
}

/// A simulation scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,
    pub description: String,
    pub customers: Vec<CustomerSpec>,
    pub steps: Vec<ScenarioStep>,
}

/// A step in a scenario. Account-bound steps act on the customer's most
/// recently opened account; payment-bound steps on their latest deposit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ScenarioStep {
    OpenAccount {
        customer: String,
        account_type: String,
    },
    /// Send the same open-account request `times` times under one key.
    RepeatOpenAccount {
        customer: String,
        account_type: String,
        times: u32,
    },
    Deposit {
        customer: String,
        amount: String,
        currency: String,
    },
    /// Post the gateway's webhook for the latest deposit `times` times.
    DeliverWebhook {
        customer: String,
        status: String,
        times: u32,
    },
    Verify {
        customer: String,
    },
    Withdraw {
        customer: String,
        amount: String,
        currency: String,
    },
    Transfer {
        from: String,
        to: String,
        amount: String,
    },
    InjectFault {
        fault: FaultType,
    },
    ClearFaults,
    Assert {
        condition: AssertCondition,
    },
}

/// Faults the simulator can inject.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FaultType {
    GatewayOffline,
    GatewayLatency { delay_ms: u64 },
    /// Gateway declines this share of verifications.
    GatewayDeclines { rate: f64 },
    /// Audit writes fail (in-memory store only).
    AuditStoreDown,
}

/// Conditions checked by `Assert` steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AssertCondition {
    /// Balance of the customer's latest account.
    BalanceEquals { customer: String, amount: String },
    AccountCount { customer: String, count: usize },
    /// Ledger numbers of the customer's accounts, in opening order.
    LedgerNumbers {
        customer: String,
        expected: Vec<String>,
    },
    /// Status code of the previous operation.
    LastStatus { code: u16 },
    /// Remark of the previous operation.
    LastRemark { remark: String },
    /// Audit records written since the scenario started.
    AuditRecords { count: usize },
}

fn customer(name: &str, serial: i64) -> CustomerSpec {
    CustomerSpec {
        name: name.to_string(),
        serial,
    }
}

fn open(name: &str) -> ScenarioStep {
    ScenarioStep::OpenAccount {
        customer: name.to_string(),
        account_type: "savings".to_string(),
    }
}

fn status_is(code: u16) -> ScenarioStep {
    ScenarioStep::Assert {
        condition: AssertCondition::LastStatus { code },
    }
}

fn balance_is(name: &str, amount: &str) -> ScenarioStep {
    ScenarioStep::Assert {
        condition: AssertCondition::BalanceEquals {
            customer: name.to_string(),
            amount: amount.to_string(),
        },
    }
}

impl Scenario {
    pub const NAMES: [&'static str; 6] = [
        "account-numbering",
        "deposit-reconciliation",
        "unsupported-currency",
        "duplicate-webhook",
        "idempotent-replay",
        "gateway-outage",
    ];

    /// Load a scenario by name.
    pub fn load(name: &str) -> anyhow::Result<Self> {
        match name {
            "account-numbering" => Ok(Self::account_numbering()),
            "deposit-reconciliation" => Ok(Self::deposit_reconciliation()),
            "unsupported-currency" => Ok(Self::unsupported_currency()),
            "duplicate-webhook" => Ok(Self::duplicate_webhook()),
            "idempotent-replay" => Ok(Self::idempotent_replay()),
            "gateway-outage" => Ok(Self::gateway_outage()),
            _ => Err(anyhow::anyhow!(
                "Unknown scenario: {} (known: {})",
                name,
                Self::NAMES.join(", ")
            )),
        }
    }

    /// Two savings accounts for one customer get consecutive ledger suffixes.
    fn account_numbering() -> Self {
        Self {
            name: "account-numbering".to_string(),
            description: "Ledger numbers for repeated account types".to_string(),
            customers: vec![customer("ADA", 123)],
            steps: vec![
                open("ADA"),
                status_is(201),
                open("ADA"),
                status_is(201),
                ScenarioStep::Assert {
                    condition: AssertCondition::LedgerNumbers {
                        customer: "ADA".to_string(),
                        expected: vec!["001000123100".to_string(), "001000123101".to_string()],
                    },
                },
            ],
        }
    }

    fn deposit_reconciliation() -> Self {
        Self {
            name: "deposit-reconciliation".to_string(),
            description: "Deposit confirmed by the gateway credits exactly once".to_string(),
            customers: vec![customer("BAYO", 42)],
            steps: vec![
                open("BAYO"),
                ScenarioStep::Deposit {
                    customer: "BAYO".to_string(),
                    amount: "5000.00".to_string(),
                    currency: "NGN".to_string(),
                },
                status_is(201),
                balance_is("BAYO", "0"),
                ScenarioStep::Verify {
                    customer: "BAYO".to_string(),
                },
                ScenarioStep::Assert {
                    condition: AssertCondition::LastRemark {
                        remark: "Payment confirmed".to_string(),
                    },
                },
                balance_is("BAYO", "5000.00"),
                // Transaction, account and payment snapshots.
                ScenarioStep::Assert {
                    condition: AssertCondition::AuditRecords { count: 3 },
                },
            ],
        }
    }

    fn unsupported_currency() -> Self {
        Self {
            name: "unsupported-currency".to_string(),
            description: "Withdrawal in a foreign currency is refused untouched".to_string(),
            customers: vec![customer("CHIDI", 7)],
            steps: vec![
                open("CHIDI"),
                ScenarioStep::Withdraw {
                    customer: "CHIDI".to_string(),
                    amount: "10.00".to_string(),
                    currency: "USD".to_string(),
                },
                status_is(400),
                balance_is("CHIDI", "0"),
                ScenarioStep::Assert {
                    condition: AssertCondition::AuditRecords { count: 0 },
                },
            ],
        }
    }

    fn duplicate_webhook() -> Self {
        Self {
            name: "duplicate-webhook".to_string(),
            description: "Webhook redelivery does not double-credit".to_string(),
            customers: vec![customer("DAYO", 9)],
            steps: vec![
                open("DAYO"),
                ScenarioStep::Deposit {
                    customer: "DAYO".to_string(),
                    amount: "750.25".to_string(),
                    currency: "NGN".to_string(),
                },
                ScenarioStep::DeliverWebhook {
                    customer: "DAYO".to_string(),
                    status: "success".to_string(),
                    times: 3,
                },
                ScenarioStep::Assert {
                    condition: AssertCondition::LastRemark {
                        remark: "Payment already confirmed".to_string(),
                    },
                },
                balance_is("DAYO", "750.25"),
            ],
        }
    }

    fn idempotent_replay() -> Self {
        Self {
            name: "idempotent-replay".to_string(),
            description: "Retried account opening creates one account".to_string(),
            customers: vec![customer("EMEKA", 11)],
            steps: vec![
                ScenarioStep::RepeatOpenAccount {
                    customer: "EMEKA".to_string(),
                    account_type: "current".to_string(),
                    times: 5,
                },
                status_is(201),
                ScenarioStep::Assert {
                    condition: AssertCondition::AccountCount {
                        customer: "EMEKA".to_string(),
                        count: 1,
                    },
                },
            ],
        }
    }

    /// Gateway outage, then recovery; the failed verify applies nothing.
    fn gateway_outage() -> Self {
        Self {
            name: "gateway-outage".to_string(),
            description: "Verification during an outage is retried by the caller".to_string(),
            customers: vec![customer("FOLA", 21), customer("GBENGA", 22)],
            steps: vec![
                open("FOLA"),
                open("GBENGA"),
                ScenarioStep::Deposit {
                    customer: "FOLA".to_string(),
                    amount: "1000".to_string(),
                    currency: "NGN".to_string(),
                },
                ScenarioStep::InjectFault {
                    fault: FaultType::GatewayOffline,
                },
                ScenarioStep::Verify {
                    customer: "FOLA".to_string(),
                },
                status_is(502),
                balance_is("FOLA", "0"),
                ScenarioStep::ClearFaults,
                ScenarioStep::Verify {
                    customer: "FOLA".to_string(),
                },
                status_is(200),
                ScenarioStep::Transfer {
                    from: "FOLA".to_string(),
                    to: "GBENGA".to_string(),
                    amount: "400".to_string(),
                },
                status_is(201),
                balance_is("FOLA", "600"),
                balance_is("GBENGA", "400"),
                ScenarioStep::InjectFault {
                    fault: FaultType::AuditStoreDown,
                },
                ScenarioStep::Withdraw {
                    customer: "FOLA".to_string(),
                    amount: "100".to_string(),
                    currency: "NGN".to_string(),
                },
                status_is(500),
                balance_is("FOLA", "600"),
                ScenarioStep::ClearFaults,
            ],
        }
    }
}
