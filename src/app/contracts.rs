//! Contract list, KPIs and CSV export.

use chrono::NaiveDate;
use uuid::Uuid;

use crate::client::ContractStore;
use crate::crm::models::{Contract, ContractInput, ContractStatus, ContractWithContact};
use crate::crm::validate;
use crate::errors::CrmError;

/// Window, in days, for the "renewals due" KPI.
pub const RENEWAL_WINDOW_DAYS: i64 = 30;

pub const CSV_HEADER: &str = "Client,Title,MRR,Status,Start,Renewal";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContractTab {
    All,
    #[default]
    Active,
    Negotiating,
    Cancelled,
}

impl ContractTab {
    pub fn includes(&self, status: ContractStatus) -> bool {
        match self {
            Self::All => true,
            Self::Active => status == ContractStatus::Active,
            Self::Negotiating => status == ContractStatus::Negotiating,
            Self::Cancelled => status == ContractStatus::Cancelled,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContractKpis {
    /// Monthly recurring revenue of active contracts.
    pub total_mrr: f64,
    pub renewals_due: usize,
    /// Cancelled share in percent, one decimal.
    pub churn_rate: String,
}

impl ContractKpis {
    pub fn compute(contracts: &[ContractWithContact], today: NaiveDate) -> Self {
        let active = || {
            contracts
                .iter()
                .map(|c| &c.contract)
                .filter(|c| c.status == ContractStatus::Active)
        };
        let renewals_due = active()
            .filter_map(|c| c.renewal_date)
            .map(|date| (date - today).num_days())
            .filter(|days| (0..=RENEWAL_WINDOW_DAYS).contains(days))
            .count();
        let cancelled = contracts
            .iter()
            .filter(|c| c.contract.status == ContractStatus::Cancelled)
            .count();
        let churn_rate = if contracts.is_empty() {
            "0.0".to_string()
        } else {
            format!("{:.1}", cancelled as f64 / contracts.len() as f64 * 100.0)
        };
        Self {
            total_mrr: active().map(|c| c.mrr).sum(),
            renewals_due,
            churn_rate,
        }
    }
}

fn quoted(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\"\""))
}

/// CSV of every contract, prefixed with a UTF-8 byte order mark.
pub fn export_csv(contracts: &[ContractWithContact]) -> String {
    let mut out = String::from('\u{feff}');
    out.push_str(CSV_HEADER);
    for row in contracts {
        let c = &row.contract;
        out.push('\n');
        out.push_str(
            &[
                quoted(row.contact_name.as_deref().unwrap_or_default()),
                quoted(&c.title),
                c.mrr.to_string(),
                c.status.as_str().to_string(),
                c.start_date.to_string(),
                c.renewal_date.map(|d| d.to_string()).unwrap_or_default(),
            ]
            .join(","),
        );
    }
    out
}

pub struct ContractBook<C> {
    client: C,
    contracts: Vec<ContractWithContact>,
    tab: ContractTab,
}

impl<C: ContractStore> ContractBook<C> {
    pub fn new(client: C) -> Self {
        Self {
            client,
            contracts: Vec::new(),
            tab: ContractTab::default(),
        }
    }

    pub fn contracts(&self) -> &[ContractWithContact] {
        &self.contracts
    }

    pub fn tab(&self) -> ContractTab {
        self.tab
    }

    pub fn select_tab(&mut self, tab: ContractTab) {
        self.tab = tab;
    }

    /// Contracts shown under the selected tab.
    pub fn visible(&self) -> Vec<&ContractWithContact> {
        self.contracts
            .iter()
            .filter(|c| self.tab.includes(c.contract.status))
            .collect()
    }

    pub fn tab_count(&self, tab: ContractTab) -> usize {
        self.contracts
            .iter()
            .filter(|c| tab.includes(c.contract.status))
            .count()
    }

    pub fn kpis(&self, today: NaiveDate) -> ContractKpis {
        ContractKpis::compute(&self.contracts, today)
    }

    pub fn export_csv(&self) -> String {
        export_csv(&self.contracts)
    }

    pub async fn load(&mut self) -> Result<&[ContractWithContact], CrmError> {
        match self.client.list_contracts().await {
            Ok(contracts) => {
                self.contracts = contracts;
                Ok(&self.contracts)
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to load contracts");
                Err(e)
            }
        }
    }

    pub async fn create(&mut self, input: ContractInput) -> Result<Contract, CrmError> {
        let input = checked(input)?;
        let created = self.client.create_contract(input).await?;
        self.reload().await;
        Ok(created)
    }

    pub async fn update(&mut self, id: Uuid, input: ContractInput) -> Result<Contract, CrmError> {
        let input = checked(input)?;
        let updated = self.client.update_contract(id, input).await?;
        self.reload().await;
        Ok(updated)
    }

    pub async fn delete(&mut self, id: Uuid) -> Result<(), CrmError> {
        self.client.delete_contract(id).await?;
        self.contracts.retain(|c| c.contract.id != id);
        Ok(())
    }

    async fn reload(&mut self) {
        // load() already logs
        let _ = self.load().await;
    }
}

fn checked(input: ContractInput) -> Result<ContractInput, CrmError> {
    Ok(ContractInput {
        title: validate::required("Title", &input.title)?,
        mrr: validate::non_negative("MRR", input.mrr)?,
        ..input
    })
}
