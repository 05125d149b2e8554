//! Quiz list and editor for agency members.

use uuid::Uuid;

use crate::client::QuizStore;
use crate::crm::models::{
    NewOption, NewQuestion, OptionUpdate, Question, QuestionKind, QuestionUpdate, Quiz, QuizDetail,
    QuizOption, QuizResponse, QuizSummary, QuizUpdate,
};
use crate::crm::validate;
use crate::errors::CrmError;

pub struct QuizBuilder<C> {
    client: C,
    quizzes: Vec<QuizSummary>,
    open: Option<QuizDetail>,
}

impl<C: QuizStore> QuizBuilder<C> {
    pub fn new(client: C) -> Self {
        Self {
            client,
            quizzes: Vec::new(),
            open: None,
        }
    }

    pub fn quizzes(&self) -> &[QuizSummary] {
        &self.quizzes
    }

    /// The quiz being edited.
    pub fn detail(&self) -> Option<&QuizDetail> {
        self.open.as_ref()
    }

    pub async fn load(&mut self) -> Result<&[QuizSummary], CrmError> {
        match self.client.list_quizzes().await {
            Ok(quizzes) => {
                self.quizzes = quizzes;
                Ok(&self.quizzes)
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to load quizzes");
                Err(e)
            }
        }
    }

    pub async fn create(&mut self, title: &str, description: &str) -> Result<Quiz, CrmError> {
        let title = validate::required("Title", title)?;
        let quiz = self
            .client
            .create_quiz(title, description.trim().to_string())
            .await?;
        self.load().await?;
        Ok(quiz)
    }

    pub async fn open(&mut self, quiz_id: Uuid) -> Result<&QuizDetail, CrmError> {
        let detail = self.client.quiz_detail(quiz_id).await?;
        Ok(self.open.insert(detail))
    }

    pub fn close(&mut self) {
        self.open = None;
    }

    fn open_id(&self) -> Result<Uuid, CrmError> {
        self.open
            .as_ref()
            .map(|d| d.quiz.id)
            .ok_or_else(|| CrmError::Validation("No quiz is open".into()))
    }

    async fn reopen(&mut self) -> Result<&QuizDetail, CrmError> {
        let id = self.open_id()?;
        self.open(id).await
    }

    pub async fn update_details(&mut self, title: &str, description: &str) -> Result<Quiz, CrmError> {
        let update = QuizUpdate {
            title: Some(validate::required("Title", title)?),
            description: Some(description.trim().to_string()),
            is_published: None,
        };
        let quiz = self.client.update_quiz(self.open_id()?, update).await?;
        self.reopen().await?;
        Ok(quiz)
    }

    pub async fn set_published(&mut self, published: bool) -> Result<Quiz, CrmError> {
        let update = QuizUpdate {
            is_published: Some(published),
            ..Default::default()
        };
        let quiz = self.client.update_quiz(self.open_id()?, update).await?;
        self.reopen().await?;
        Ok(quiz)
    }

    pub async fn add_question(&mut self, text: &str, kind: QuestionKind) -> Result<Question, CrmError> {
        let text = validate::required("Question", text)?;
        let question = self
            .client
            .add_question(self.open_id()?, NewQuestion { text, kind })
            .await?;
        self.reopen().await?;
        Ok(question)
    }

    pub async fn update_question(&mut self, id: Uuid, update: QuestionUpdate) -> Result<Question, CrmError> {
        let question = self.client.update_question(id, update).await?;
        self.reopen().await?;
        Ok(question)
    }

    /// Removes the question and its options.
    pub async fn delete_question(&mut self, id: Uuid) -> Result<(), CrmError> {
        self.client.delete_question(id).await?;
        self.reopen().await?;
        Ok(())
    }

    /// Move a question to `index`; positions are rewritten 0..n.
    pub async fn move_question(&mut self, id: Uuid, index: usize) -> Result<&QuizDetail, CrmError> {
        let quiz_id = self.open_id()?;
        let mut order: Vec<Uuid> = self
            .open
            .as_ref()
            .map(|d| d.questions.iter().map(|q| q.id).collect())
            .unwrap_or_default();
        let from = order
            .iter()
            .position(|q| *q == id)
            .ok_or_else(|| CrmError::not_found("Question", id))?;
        let moved = order.remove(from);
        order.insert(index.min(order.len()), moved);
        self.client.reorder_questions(quiz_id, order).await?;
        self.reopen().await
    }

    pub async fn add_option(&mut self, question_id: Uuid, text: &str, points: i32) -> Result<QuizOption, CrmError> {
        let option = NewOption {
            text: validate::required("Option", text)?,
            points,
        };
        let option = self.client.add_option(question_id, option).await?;
        self.reopen().await?;
        Ok(option)
    }

    pub async fn update_option(&mut self, id: Uuid, update: OptionUpdate) -> Result<QuizOption, CrmError> {
        let option = self.client.update_option(id, update).await?;
        self.reopen().await?;
        Ok(option)
    }

    pub async fn delete_option(&mut self, id: Uuid) -> Result<(), CrmError> {
        self.client.delete_option(id).await?;
        self.reopen().await?;
        Ok(())
    }

    pub async fn responses(&self, quiz_id: Uuid) -> Result<Vec<QuizResponse>, CrmError> {
        self.client.list_responses(quiz_id).await
    }

    /// Delete a quiz with its questions, options and responses.
    pub async fn delete(&mut self, quiz_id: Uuid) -> Result<(), CrmError> {
        self.client.delete_quiz(quiz_id).await?;
        if self.open.as_ref().is_some_and(|d| d.quiz.id == quiz_id) {
            self.open = None;
        }
        self.quizzes.retain(|q| q.quiz.id != quiz_id);
        Ok(())
    }
}
