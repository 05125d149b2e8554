//! End-to-end pipeline scenarios against the in-process backend.

use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::app::board::{DropOutcome, DropTarget, PipelineBoard, SyncState};
use crate::app::quiz_flow::QuizFlow;
use crate::app::quiz_flow::tests::{fill, publish_fit_check};
use crate::client::local::tests::seeded;
use crate::client::{DealStore, LocalClient};
use crate::crm::models::{Deal, DealWithContact, NewDeal, Stage};
use crate::errors::CrmError;

async fn deal(client: &LocalClient, title: &str, stage: Stage) -> Uuid {
    client
        .create_deal(NewDeal {
            title: title.into(),
            value: 1000.0,
            stage: Some(stage),
            contact_id: None,
        })
        .await
        .unwrap()
        .id
}

async fn stored_stage(client: &LocalClient, id: Uuid) -> Stage {
    let deals = client.list_deals().await.unwrap();
    deals.iter().find(|d| d.deal.id == id).unwrap().deal.stage
}

#[tokio::test]
async fn quiz_lead_lands_in_first_stage() {
    let (anon, owner, _) = seeded();
    let mut board = PipelineBoard::new(owner.clone());
    board.load_deals().await.unwrap();
    let columns = board.columns();
    assert_eq!(columns.len(), 6);
    assert!(columns.iter().all(|c| c.deals.is_empty()));

    let mut subscription = board.watch().await.unwrap();
    let quiz_id = publish_fit_check(&owner).await;
    let mut flow = QuizFlow::load(anon, quiz_id).await.unwrap();
    fill(&mut flow, "Large");
    let receipt = flow.submit().await.unwrap();

    let message = tokio::time::timeout(Duration::from_secs(2), subscription.next())
        .await
        .unwrap()
        .unwrap();
    assert!(board.handle_message(&message).await.unwrap());

    let first = &board.columns()[0];
    assert_eq!(first.stage, Stage::first());
    assert_eq!(first.deals.len(), 1);
    assert_eq!(first.deals[0].deal.id, receipt.deal_id);
    assert_eq!(first.deals[0].deal.value, 0.0);
    assert_eq!(first.deals[0].contact_name.as_deref(), Some("Ana"));
}

#[tokio::test]
async fn drag_to_empty_column() {
    let (_, owner, _) = seeded();
    let d1 = deal(&owner, "d1", Stage::NewLeads).await;
    let mut board = PipelineBoard::new(owner.clone());
    board.load_deals().await.unwrap();
    assert!(board.columns()[Stage::Qualified.index()].deals.is_empty());

    board.begin_drag(d1).unwrap();
    let outcome = board
        .end_drag(Some(DropTarget::Column(Stage::Qualified)))
        .await
        .unwrap();
    assert!(matches!(outcome, DropOutcome::Confirmed(_)));
    assert_eq!(board.deal(d1).unwrap().deal.stage, Stage::Qualified);
    assert_eq!(stored_stage(&owner, d1).await, Stage::Qualified);
}

#[tokio::test]
async fn drag_onto_card_takes_its_stage() {
    let (_, owner, _) = seeded();
    let d1 = deal(&owner, "d1", Stage::Contacted).await;
    let d2 = deal(&owner, "d2", Stage::Proposal).await;
    let mut board = PipelineBoard::new(owner.clone());
    board.load_deals().await.unwrap();
    let d2_before = board.deal(d2).unwrap().clone();

    board.complete_drag(d1, DropTarget::Card(d2)).await.unwrap();
    assert_eq!(board.deal(d1).unwrap().deal.stage, Stage::Proposal);
    assert_eq!(stored_stage(&owner, d1).await, Stage::Proposal);
    assert_eq!(board.deal(d2).unwrap(), &d2_before);
}

/// Delegates to the local backend but rejects every stage update.
#[derive(Clone)]
struct RejectingStages(LocalClient);

#[async_trait]
impl DealStore for RejectingStages {
    async fn list_deals(&self) -> Result<Vec<DealWithContact>, CrmError> {
        self.0.list_deals().await
    }
    async fn create_deal(&self, deal: NewDeal) -> Result<Deal, CrmError> {
        self.0.create_deal(deal).await
    }
    async fn update_deal_stage(&self, _id: Uuid, _stage: Stage) -> Result<Deal, CrmError> {
        Err(CrmError::Transient("connection reset by peer".into()))
    }
    async fn delete_deal(&self, id: Uuid) -> Result<(), CrmError> {
        self.0.delete_deal(id).await
    }
}

#[tokio::test]
async fn failed_move_shows_original_stage() {
    let (_, owner, _) = seeded();
    let d1 = deal(&owner, "d1", Stage::NewLeads).await;
    let mut board = PipelineBoard::new(RejectingStages(owner.clone()));
    board.load_deals().await.unwrap();

    let pending = board
        .apply_drop(d1, DropTarget::Column(Stage::Negotiation))
        .unwrap()
        .unwrap();
    assert_eq!(board.deal(d1).unwrap().deal.stage, Stage::Negotiation);

    let outcome = board.settle(pending).await;
    assert!(matches!(outcome, DropOutcome::Reverted { .. }));
    assert_eq!(board.sync_state(), SyncState::Reverted(pending));
    assert_eq!(board.deal(d1).unwrap().deal.stage, Stage::NewLeads);
    assert_eq!(board.deals(), &owner.list_deals().await.unwrap()[..]);
}
