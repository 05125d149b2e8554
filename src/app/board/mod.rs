//! Pipeline board.
//!
//! Holds the tenant's deals as a stale-tolerant cache and moves them between
//! the fixed stage columns. A move is applied to memory first, then the
//! stage alone is persisted; if that fails the whole list is reloaded from
//! the store, discarding the optimistic change.
//!
//! ```text
//! Idle ──apply_drop──> OptimisticallyMutated ──settle──> Confirmed
//!                                             └──────> Reverted (reload)
//! ```

pub mod dnd;

use uuid::Uuid;

use crate::client::{DealStore, Realtime, RealtimeMessage, Subscription};
use crate::crm::feed::{ChangeEvent, ChangeFilter, Table};
use crate::crm::models::{BoardView, ColumnView, Deal, DealWithContact, NewDeal, Stage};
use crate::crm::validate;
use crate::errors::{BoardError, CrmError};

pub use dnd::{DragEvent, DropTarget};

/// A deal picked up by the pointer, with the snapshot used for the preview.
#[derive(Debug, Clone, PartialEq)]
pub struct DragSession {
    pub deal_id: Uuid,
    pub preview: DealWithContact,
}

/// The target under the pointer and the stage it resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hover {
    pub target: DropTarget,
    pub stage: Option<Stage>,
}

/// A stage change applied in memory but not yet persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingMove {
    pub deal_id: Uuid,
    pub from: Stage,
    pub to: Stage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncState {
    #[default]
    Idle,
    OptimisticallyMutated(PendingMove),
    Confirmed(PendingMove),
    Reverted(PendingMove),
}

#[derive(Debug)]
pub enum DropOutcome {
    /// Same stage or unresolvable target: nothing was called or changed.
    Unchanged,
    Confirmed(Deal),
    /// The store rejected the move and the list was reloaded.
    Reverted { error: CrmError },
}

/// Dashboard aggregate over the cached deals.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSummary {
    pub deal_count: usize,
    /// Value of deals not yet closed.
    pub open_value: f64,
    pub closed_value: f64,
    pub per_stage: Vec<(Stage, usize)>,
}

pub struct PipelineBoard<C> {
    client: C,
    deals: Vec<DealWithContact>,
    drag: Option<DragSession>,
    hover: Option<Hover>,
    sync: SyncState,
}

impl<C: DealStore> PipelineBoard<C> {
    pub fn new(client: C) -> Self {
        Self {
            client,
            deals: Vec::new(),
            drag: None,
            hover: None,
            sync: SyncState::Idle,
        }
    }

    pub fn deals(&self) -> &[DealWithContact] {
        &self.deals
    }

    pub fn deal(&self, id: Uuid) -> Option<&DealWithContact> {
        self.deals.iter().find(|d| d.deal.id == id)
    }

    pub fn sync_state(&self) -> SyncState {
        self.sync
    }

    pub fn drag(&self) -> Option<&DragSession> {
        self.drag.as_ref()
    }

    pub fn hover(&self) -> Option<Hover> {
        self.hover
    }

    /// Replace the cache with the store's deals. On failure the previous
    /// list is kept.
    pub async fn load_deals(&mut self) -> Result<&[DealWithContact], CrmError> {
        match self.client.list_deals().await {
            Ok(deals) => {
                self.deals = deals;
                Ok(&self.deals)
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to load deals");
                Err(e)
            }
        }
    }

    pub fn begin_drag(&mut self, deal_id: Uuid) -> Result<&DragSession, BoardError> {
        if let Some(active) = &self.drag {
            return Err(BoardError::DragInProgress(active.deal_id));
        }
        let preview = self
            .deal(deal_id)
            .cloned()
            .ok_or(BoardError::DealNotFound(deal_id))?;
        self.hover = None;
        Ok(self.drag.insert(DragSession { deal_id, preview }))
    }

    /// Record the hovered target for highlighting. Never touches deals.
    pub fn over_target(&mut self, target: DropTarget) -> Option<Stage> {
        let stage = self.resolve_target(target);
        self.hover = Some(Hover { target, stage });
        stage
    }

    pub fn cancel_drag(&mut self) {
        self.drag = None;
        self.hover = None;
    }

    /// A column is its own stage; a card stands for the stage it sits in.
    pub fn resolve_target(&self, target: DropTarget) -> Option<Stage> {
        match target {
            DropTarget::Column(stage) => Some(stage),
            DropTarget::Card(id) => self.deal(id).map(|d| d.deal.stage),
        }
    }

    /// Apply a drop to memory. `None` when there is nothing to persist.
    pub fn apply_drop(&mut self, deal_id: Uuid, target: DropTarget) -> Result<Option<PendingMove>, BoardError> {
        let from = self
            .deal(deal_id)
            .map(|d| d.deal.stage)
            .ok_or(BoardError::DealNotFound(deal_id))?;
        let Some(to) = self.resolve_target(target) else {
            return Ok(None);
        };
        if to == from {
            return Ok(None);
        }
        if let Some(entry) = self.deals.iter_mut().find(|d| d.deal.id == deal_id) {
            entry.deal.stage = to;
        }
        let pending = PendingMove { deal_id, from, to };
        self.sync = SyncState::OptimisticallyMutated(pending);
        Ok(Some(pending))
    }

    /// Persist a pending move, reconciling by full reload on failure.
    pub async fn settle(&mut self, pending: PendingMove) -> DropOutcome {
        match self.client.update_deal_stage(pending.deal_id, pending.to).await {
            Ok(deal) => {
                if let Some(entry) = self.deals.iter_mut().find(|d| d.deal.id == deal.id) {
                    entry.deal = deal.clone();
                }
                self.sync = SyncState::Confirmed(pending);
                tracing::debug!(deal_id = %pending.deal_id, stage = pending.to.as_str(), "deal moved");
                DropOutcome::Confirmed(deal)
            }
            Err(error) => {
                tracing::warn!(deal_id = %pending.deal_id, error = %error, "stage update failed, reloading deals");
                self.sync = SyncState::Reverted(pending);
                if self.load_deals().await.is_err()
                    && let Some(entry) = self.deals.iter_mut().find(|d| d.deal.id == pending.deal_id)
                {
                    entry.deal.stage = pending.from;
                }
                DropOutcome::Reverted { error }
            }
        }
    }

    /// Drop `deal_id` on `target`. Rejected while a different deal is
    /// being dragged.
    pub async fn complete_drag(&mut self, deal_id: Uuid, target: DropTarget) -> Result<DropOutcome, BoardError> {
        if let Some(session) = &self.drag {
            if session.deal_id != deal_id {
                return Err(BoardError::DragInProgress(session.deal_id));
            }
            self.drag = None;
            self.hover = None;
        }
        match self.apply_drop(deal_id, target)? {
            Some(pending) => Ok(self.settle(pending).await),
            None => Ok(DropOutcome::Unchanged),
        }
    }

    /// Finish the active drag over `target` (or over nothing).
    pub async fn end_drag(&mut self, target: Option<DropTarget>) -> Result<DropOutcome, BoardError> {
        let session = self.drag.take().ok_or(BoardError::NoActiveDrag)?;
        self.hover = None;
        match target {
            Some(target) => self.complete_drag(session.deal_id, target).await,
            None => Ok(DropOutcome::Unchanged),
        }
    }

    /// Feed one event from the drag primitive.
    pub async fn handle(&mut self, event: DragEvent) -> Result<Option<DropOutcome>, BoardError> {
        match event {
            DragEvent::Start(deal_id) => {
                self.begin_drag(deal_id)?;
                Ok(None)
            }
            DragEvent::Over(Some(target)) => {
                self.over_target(target);
                Ok(None)
            }
            DragEvent::Over(None) => {
                self.hover = None;
                Ok(None)
            }
            DragEvent::End(target) => self.end_drag(target).await.map(Some),
            DragEvent::Cancel => {
                self.cancel_drag();
                Ok(None)
            }
        }
    }

    /// Delete one deal after the user confirmed it.
    pub async fn delete_deal(&mut self, deal_id: Uuid, confirmed: bool) -> Result<(), BoardError> {
        if !confirmed {
            return Err(BoardError::NotConfirmed);
        }
        let index = self
            .deals
            .iter()
            .position(|d| d.deal.id == deal_id)
            .ok_or(BoardError::DealNotFound(deal_id))?;
        if let Err(e) = self.client.delete_deal(deal_id).await {
            tracing::warn!(deal_id = %deal_id, error = %e, "failed to delete deal");
            return Err(e.into());
        }
        self.deals.remove(index);
        Ok(())
    }

    /// Validate and insert a deal from the "new deal" form, then reload.
    pub async fn create_deal(&mut self, deal: NewDeal) -> Result<Deal, BoardError> {
        let deal = NewDeal {
            title: validate::required("Title", &deal.title)?,
            value: validate::non_negative("Value", deal.value)?,
            ..deal
        };
        let created = self.client.create_deal(deal).await?;
        if self.load_deals().await.is_err() {
            self.deals.insert(
                0,
                DealWithContact {
                    deal: created.clone(),
                    contact_name: None,
                },
            );
        }
        Ok(created)
    }

    /// Reload when a change on `deals` arrives. Returns whether it reloaded.
    pub async fn refresh_on_change(&mut self, event: &ChangeEvent) -> Result<bool, CrmError> {
        if event.table != Table::Deals {
            return Ok(false);
        }
        self.load_deals().await?;
        Ok(true)
    }

    /// Apply one realtime message; a resync marker always reloads.
    pub async fn handle_message(&mut self, message: &RealtimeMessage) -> Result<bool, CrmError> {
        match message {
            RealtimeMessage::Change(event) => self.refresh_on_change(event).await,
            RealtimeMessage::Resync { skipped } => {
                tracing::debug!(skipped, "deal changes were dropped, reloading");
                self.load_deals().await?;
                Ok(true)
            }
        }
    }

    /// Every stage in order, empty ones included.
    pub fn columns(&self) -> Vec<ColumnView> {
        Stage::ALL
            .iter()
            .map(|&stage| {
                let deals: Vec<DealWithContact> = self
                    .deals
                    .iter()
                    .filter(|d| d.deal.stage == stage)
                    .cloned()
                    .collect();
                ColumnView {
                    stage,
                    label: stage.label().to_string(),
                    total_value: deals.iter().map(|d| d.deal.value).sum(),
                    deals,
                }
            })
            .collect()
    }

    pub fn board_view(&self) -> BoardView {
        BoardView {
            columns: self.columns(),
        }
    }

    pub fn summary(&self) -> PipelineSummary {
        let (closed, open): (Vec<_>, Vec<_>) = self
            .deals
            .iter()
            .partition(|d| d.deal.stage == Stage::Closed);
        PipelineSummary {
            deal_count: self.deals.len(),
            open_value: open.iter().map(|d| d.deal.value).sum(),
            closed_value: closed.iter().map(|d| d.deal.value).sum(),
            per_stage: Stage::ALL
                .iter()
                .map(|&s| (s, self.deals.iter().filter(|d| d.deal.stage == s).count()))
                .collect(),
        }
    }
}

impl<C: DealStore + Realtime> PipelineBoard<C> {
    /// Subscribe to deal changes; pass each message to `handle_message`.
    pub async fn watch(&self) -> Result<Subscription, CrmError> {
        self.client.subscribe(ChangeFilter::table(Table::Deals)).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use proptest::prelude::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct FakeState {
        deals: Vec<DealWithContact>,
        update_calls: usize,
        delete_calls: usize,
        fail_updates: bool,
        fail_list: bool,
        fail_delete: bool,
    }

    /// In-memory deal store that counts calls and fails on demand.
    #[derive(Clone, Default)]
    pub(crate) struct FakeDeals {
        state: Arc<Mutex<FakeState>>,
    }

    pub(crate) fn deal(title: &str, stage: Stage) -> DealWithContact {
        DealWithContact {
            deal: Deal {
                id: Uuid::new_v4(),
                agency_id: Uuid::nil(),
                contact_id: None,
                title: title.to_string(),
                value: 100.0,
                stage,
                created_at: "2026-01-01T00:00:00.000Z".to_string(),
            },
            contact_name: None,
        }
    }

    impl FakeDeals {
        fn with(deals: Vec<DealWithContact>) -> Self {
            let fake = Self::default();
            fake.state.lock().unwrap().deals = deals;
            fake
        }

        fn update_calls(&self) -> usize {
            self.state.lock().unwrap().update_calls
        }

        fn delete_calls(&self) -> usize {
            self.state.lock().unwrap().delete_calls
        }

        fn stored_stage(&self, id: Uuid) -> Option<Stage> {
            let state = self.state.lock().unwrap();
            state.deals.iter().find(|d| d.deal.id == id).map(|d| d.deal.stage)
        }

        fn fail_updates(&self) {
            self.state.lock().unwrap().fail_updates = true;
        }
    }

    #[async_trait]
    impl DealStore for FakeDeals {
        async fn list_deals(&self) -> Result<Vec<DealWithContact>, CrmError> {
            let state = self.state.lock().unwrap();
            if state.fail_list {
                return Err(CrmError::Transient("offline".into()));
            }
            Ok(state.deals.clone())
        }

        async fn create_deal(&self, new: NewDeal) -> Result<Deal, CrmError> {
            let mut state = self.state.lock().unwrap();
            let mut created = deal(&new.title, new.stage.unwrap_or(Stage::first()));
            created.deal.value = new.value;
            state.deals.insert(0, created.clone());
            Ok(created.deal)
        }

        async fn update_deal_stage(&self, id: Uuid, stage: Stage) -> Result<Deal, CrmError> {
            let mut state = self.state.lock().unwrap();
            state.update_calls += 1;
            if state.fail_updates {
                return Err(CrmError::Transient("connection reset".into()));
            }
            let entry = state
                .deals
                .iter_mut()
                .find(|d| d.deal.id == id)
                .ok_or_else(|| CrmError::not_found("Deal", id))?;
            entry.deal.stage = stage;
            Ok(entry.deal.clone())
        }

        async fn delete_deal(&self, id: Uuid) -> Result<(), CrmError> {
            let mut state = self.state.lock().unwrap();
            state.delete_calls += 1;
            if state.fail_delete {
                return Err(CrmError::Forbidden("not allowed".into()));
            }
            state.deals.retain(|d| d.deal.id != id);
            Ok(())
        }
    }

    async fn loaded(deals: Vec<DealWithContact>) -> (FakeDeals, PipelineBoard<FakeDeals>) {
        let fake = FakeDeals::with(deals);
        let mut board = PipelineBoard::new(fake.clone());
        board.load_deals().await.unwrap();
        (fake, board)
    }

    #[tokio::test]
    async fn test_drop_on_every_stage_persists() {
        for target in Stage::ALL {
            let d1 = deal("d1", Stage::NewLeads);
            let id = d1.deal.id;
            let (fake, mut board) = loaded(vec![d1]).await;

            let outcome = board.complete_drag(id, DropTarget::Column(target)).await.unwrap();
            if target == Stage::NewLeads {
                assert!(matches!(outcome, DropOutcome::Unchanged));
                assert_eq!(fake.update_calls(), 0);
            } else {
                assert!(matches!(outcome, DropOutcome::Confirmed(ref d) if d.stage == target));
                assert_eq!(board.sync_state(), SyncState::Confirmed(PendingMove { deal_id: id, from: Stage::NewLeads, to: target }));
            }
            assert_eq!(board.deal(id).unwrap().deal.stage, target);
            assert_eq!(fake.stored_stage(id), Some(target));
        }
    }

    #[tokio::test]
    async fn test_card_drop_matches_column_drop() {
        let d1 = deal("d1", Stage::Contacted);
        let d2 = deal("d2", Stage::Negotiation);
        let (id1, id2) = (d1.deal.id, d2.deal.id);
        let (_, mut via_card) = loaded(vec![d1.clone(), d2.clone()]).await;
        let (_, mut via_column) = loaded(vec![d1, d2]).await;

        via_card.complete_drag(id1, DropTarget::Card(id2)).await.unwrap();
        via_column
            .complete_drag(id1, DropTarget::Column(Stage::Negotiation))
            .await
            .unwrap();

        assert_eq!(via_card.deal(id1).unwrap().deal.stage, Stage::Negotiation);
        assert_eq!(via_card.deals(), via_column.deals());
        assert_eq!(via_card.deal(id2).unwrap().deal.stage, Stage::Negotiation);
    }

    #[tokio::test]
    async fn test_unknown_card_target_is_noop() {
        let d1 = deal("d1", Stage::Contacted);
        let id = d1.deal.id;
        let (fake, mut board) = loaded(vec![d1]).await;
        let outcome = board
            .complete_drag(id, DropTarget::Card(Uuid::new_v4()))
            .await
            .unwrap();
        assert!(matches!(outcome, DropOutcome::Unchanged));
        assert_eq!(fake.update_calls(), 0);
    }

    #[tokio::test]
    async fn test_failed_update_reconciles_to_fresh_load() {
        let d1 = deal("d1", Stage::NewLeads);
        let id = d1.deal.id;
        let (fake, mut board) = loaded(vec![d1, deal("d2", Stage::Closed)]).await;
        fake.fail_updates();

        // another session inserts a deal meanwhile
        fake.state.lock().unwrap().deals.push(deal("d3", Stage::Qualified));

        let outcome = board.complete_drag(id, DropTarget::Column(Stage::Proposal)).await.unwrap();
        assert!(matches!(outcome, DropOutcome::Reverted { error: CrmError::Transient(_) }));
        assert!(matches!(board.sync_state(), SyncState::Reverted(_)));

        let fresh = fake.list_deals().await.unwrap();
        assert_eq!(board.deals(), &fresh[..]);
        assert_eq!(board.deal(id).unwrap().deal.stage, Stage::NewLeads);
    }

    #[tokio::test]
    async fn test_failed_update_and_failed_reload_restores_stage() {
        let d1 = deal("d1", Stage::NewLeads);
        let id = d1.deal.id;
        let (fake, mut board) = loaded(vec![d1]).await;
        {
            let mut state = fake.state.lock().unwrap();
            state.fail_updates = true;
            state.fail_list = true;
        }
        board.complete_drag(id, DropTarget::Column(Stage::Closed)).await.unwrap();
        assert_eq!(board.deal(id).unwrap().deal.stage, Stage::NewLeads);
    }

    #[tokio::test]
    async fn test_optimistic_mutation_is_synchronous() {
        let d1 = deal("d1", Stage::NewLeads);
        let id = d1.deal.id;
        let (fake, mut board) = loaded(vec![d1]).await;

        let pending = board
            .apply_drop(id, DropTarget::Column(Stage::Qualified))
            .unwrap()
            .unwrap();
        assert_eq!(board.deal(id).unwrap().deal.stage, Stage::Qualified);
        assert_eq!(board.sync_state(), SyncState::OptimisticallyMutated(pending));
        assert_eq!(fake.update_calls(), 0);

        board.settle(pending).await;
        assert_eq!(fake.update_calls(), 1);
    }

    #[tokio::test]
    async fn test_delete_removes_exactly_one() {
        let d1 = deal("d1", Stage::NewLeads);
        let id = d1.deal.id;
        let (fake, mut board) = loaded(vec![deal("a", Stage::Closed), d1, deal("b", Stage::Closed)]).await;

        assert!(matches!(board.delete_deal(id, false).await, Err(BoardError::NotConfirmed)));
        assert_eq!(fake.delete_calls(), 0);

        board.delete_deal(id, true).await.unwrap();
        assert_eq!(fake.delete_calls(), 1);
        assert_eq!(board.deals().len(), 2);
        assert!(board.deal(id).is_none());
    }

    #[tokio::test]
    async fn test_failed_delete_leaves_list() {
        let d1 = deal("d1", Stage::NewLeads);
        let id = d1.deal.id;
        let (fake, mut board) = loaded(vec![d1]).await;
        fake.state.lock().unwrap().fail_delete = true;
        let before = board.deals().to_vec();
        assert!(matches!(
            board.delete_deal(id, true).await,
            Err(BoardError::Store(CrmError::Forbidden(_)))
        ));
        assert_eq!(board.deals(), &before[..]);
    }

    #[tokio::test]
    async fn test_failed_load_keeps_previous_state() {
        let (fake, mut board) = loaded(vec![deal("d1", Stage::NewLeads)]).await;
        fake.state.lock().unwrap().fail_list = true;
        assert!(board.load_deals().await.is_err());
        assert_eq!(board.deals().len(), 1);
    }

    #[tokio::test]
    async fn test_drag_session_rules() {
        let d1 = deal("d1", Stage::NewLeads);
        let d2 = deal("d2", Stage::Proposal);
        let (id1, id2) = (d1.deal.id, d2.deal.id);
        let (_, mut board) = loaded(vec![d1, d2]).await;

        assert!(matches!(
            board.begin_drag(Uuid::new_v4()),
            Err(BoardError::DealNotFound(_))
        ));
        assert_eq!(board.begin_drag(id1).unwrap().preview.deal.title, "d1");
        assert!(matches!(board.begin_drag(id2), Err(BoardError::DragInProgress(active)) if active == id1));

        assert_eq!(board.over_target(DropTarget::Card(id2)), Some(Stage::Proposal));
        // hovering never mutates
        assert_eq!(board.deal(id1).unwrap().deal.stage, Stage::NewLeads);

        board.cancel_drag();
        assert!(board.drag().is_none());
        assert!(matches!(board.end_drag(None).await, Err(BoardError::NoActiveDrag)));
    }

    #[tokio::test]
    async fn test_event_sequence_moves_deal() {
        let d1 = deal("d1", Stage::NewLeads);
        let id = d1.deal.id;
        let (_, mut board) = loaded(vec![d1]).await;

        board.handle(DragEvent::Start(id)).await.unwrap();
        board
            .handle(DragEvent::Over(Some(DropTarget::Column(Stage::Contacted))))
            .await
            .unwrap();
        assert_eq!(board.hover().unwrap().stage, Some(Stage::Contacted));
        let outcome = board
            .handle(DragEvent::End(Some(DropTarget::Column(Stage::Contacted))))
            .await
            .unwrap();
        assert!(matches!(outcome, Some(DropOutcome::Confirmed(_))));
        assert!(board.drag().is_none());
        assert!(board.hover().is_none());
    }

    #[tokio::test]
    async fn test_dropping_another_deal_mid_drag_is_rejected() {
        let d1 = deal("d1", Stage::NewLeads);
        let d2 = deal("d2", Stage::Contacted);
        let (id1, id2) = (d1.deal.id, d2.deal.id);
        let (fake, mut board) = loaded(vec![d1, d2]).await;

        board.begin_drag(id1).unwrap();
        board.over_target(DropTarget::Column(Stage::Qualified));
        let err = board
            .complete_drag(id2, DropTarget::Column(Stage::Proposal))
            .await
            .unwrap_err();
        assert!(matches!(err, BoardError::DragInProgress(active) if active == id1));
        assert_eq!(board.deal(id2).unwrap().deal.stage, Stage::Contacted);
        assert_eq!(fake.update_calls(), 0);

        // the original session is still usable
        assert_eq!(board.drag().unwrap().deal_id, id1);
        let outcome = board
            .end_drag(Some(DropTarget::Column(Stage::Qualified)))
            .await
            .unwrap();
        assert!(matches!(outcome, DropOutcome::Confirmed(_)));
        assert!(board.drag().is_none());
        board.begin_drag(id2).unwrap();
    }

    #[tokio::test]
    async fn test_columns_include_empty_stages() {
        let (_, board) = loaded(vec![deal("a", Stage::Qualified), deal("b", Stage::Qualified)]).await;
        let columns = board.columns();
        assert_eq!(columns.len(), 6);
        assert_eq!(columns.iter().map(|c| c.stage).collect::<Vec<_>>(), Stage::ALL.to_vec());
        assert_eq!(columns[2].deals.len(), 2);
        assert_eq!(columns[2].total_value, 200.0);
        assert!(columns[0].deals.is_empty());
        assert_eq!(columns[0].label, "New Leads");
    }

    #[tokio::test]
    async fn test_create_deal_validates_then_reloads() {
        let (_, mut board) = loaded(vec![]).await;
        let err = board
            .create_deal(NewDeal {
                title: "Audit".into(),
                value: -5.0,
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BoardError::Store(CrmError::Validation(_))));
        assert!(board.deals().is_empty());

        let created = board
            .create_deal(NewDeal {
                title: " Audit ".into(),
                value: 50.0,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(created.title, "Audit");
        assert_eq!(board.deals().len(), 1);
    }

    #[tokio::test]
    async fn test_refresh_only_on_deal_changes() {
        let (fake, mut board) = loaded(vec![]).await;
        fake.state.lock().unwrap().deals.push(deal("new", Stage::NewLeads));

        let other = ChangeEvent::new(Table::Contacts, crate::crm::feed::ChangeKind::Insert, None, &());
        assert!(!board.refresh_on_change(&other).await.unwrap());
        assert!(board.deals().is_empty());

        let change = ChangeEvent::new(Table::Deals, crate::crm::feed::ChangeKind::Insert, None, &());
        assert!(board.refresh_on_change(&change).await.unwrap());
        assert_eq!(board.deals().len(), 1);
    }

    #[tokio::test]
    async fn test_resync_marker_reloads() {
        let (fake, mut board) = loaded(vec![]).await;
        fake.state.lock().unwrap().deals.push(deal("missed", Stage::NewLeads));

        let other: RealtimeMessage =
            ChangeEvent::new(Table::Contacts, crate::crm::feed::ChangeKind::Insert, None, &()).into();
        assert!(!board.handle_message(&other).await.unwrap());
        assert!(board.deals().is_empty());

        assert!(board.handle_message(&RealtimeMessage::Resync { skipped: 40 }).await.unwrap());
        assert_eq!(board.deals()[0].deal.title, "missed");
    }

    #[tokio::test]
    async fn test_summary_splits_open_and_closed() {
        let (_, board) = loaded(vec![
            deal("a", Stage::NewLeads),
            deal("b", Stage::Closed),
            deal("c", Stage::Proposal),
        ])
        .await;
        let summary = board.summary();
        assert_eq!(summary.deal_count, 3);
        assert_eq!(summary.open_value, 200.0);
        assert_eq!(summary.closed_value, 100.0);
        assert_eq!(summary.per_stage[3], (Stage::Proposal, 1));
    }

    proptest! {
        #[test]
        fn prop_drop_on_own_stage_is_noop(
            stages in proptest::collection::vec(0usize..6, 1..12),
            pick in any::<proptest::sample::Index>(),
            via_card in any::<bool>(),
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let deals = stages
                    .iter()
                    .enumerate()
                    .map(|(i, &s)| deal(&format!("d{}", i), Stage::ALL[s]))
                    .collect();
                let (fake, mut board) = loaded(deals).await;
                let before = board.deals().to_vec();
                let dragged = before[pick.index(before.len())].clone();
                let stage = dragged.deal.stage;

                let target = if via_card {
                    let peer = before
                        .iter()
                        .rev()
                        .find(|d| d.deal.stage == stage)
                        .map(|d| d.deal.id)
                        .unwrap_or(dragged.deal.id);
                    DropTarget::Card(peer)
                } else {
                    DropTarget::Column(stage)
                };

                let outcome = board.complete_drag(dragged.deal.id, target).await.unwrap();
                prop_assert!(matches!(outcome, DropOutcome::Unchanged));
                prop_assert_eq!(board.deals(), &before[..]);
                prop_assert_eq!(board.sync_state(), SyncState::Idle);
                prop_assert_eq!(fake.update_calls(), 0);
                Ok(())
            })?;
        }
    }
}
