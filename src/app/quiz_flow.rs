//! Public quiz wizard.
//!
//! Step 0 collects the respondent, steps 1..=N are the quiz questions in
//! position order. The wizard only advances over complete steps and never
//! calls the store until `submit`.

use std::collections::HashMap;

use uuid::Uuid;

use crate::client::QuizStore;
use crate::crm::models::{
    LeadStatus, PublicQuiz, Question, QuestionKind, QuizSubmission, Respondent, SubmissionReceipt,
    SubmittedAnswer,
};
use crate::errors::QuizFlowError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowState {
    Collecting(usize),
    Submitting,
    Completed(SubmissionReceipt),
    Failed(String),
}

impl FlowState {
    fn name(&self) -> &'static str {
        match self {
            Self::Collecting(_) => "collecting",
            Self::Submitting => "submitting",
            Self::Completed(_) => "completed",
            Self::Failed(_) => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Answer {
    Choice(Uuid),
    Text(String),
}

pub struct QuizFlow<C> {
    client: C,
    quiz: PublicQuiz,
    respondent: Respondent,
    answers: HashMap<Uuid, Answer>,
    state: FlowState,
}

impl<C: QuizStore> QuizFlow<C> {
    /// Fetch a published quiz and start at the identity step.
    pub async fn load(client: C, quiz_id: Uuid) -> Result<Self, QuizFlowError> {
        let mut quiz = client.published_quiz(quiz_id).await?;
        quiz.questions.sort_by_key(|q| q.position);
        for question in &mut quiz.questions {
            question.options.sort_by(|a, b| a.text.cmp(&b.text));
        }
        tracing::debug!(quiz_id = %quiz_id, questions = quiz.questions.len(), "quiz loaded");
        Ok(Self {
            client,
            quiz,
            respondent: Respondent::default(),
            answers: HashMap::new(),
            state: FlowState::Collecting(0),
        })
    }

    pub fn quiz(&self) -> &PublicQuiz {
        &self.quiz
    }

    pub fn state(&self) -> &FlowState {
        &self.state
    }

    pub fn respondent(&self) -> &Respondent {
        &self.respondent
    }

    pub fn answer(&self, question_id: Uuid) -> Option<&Answer> {
        self.answers.get(&question_id)
    }

    /// Identity step plus one step per question.
    pub fn step_count(&self) -> usize {
        self.quiz.questions.len() + 1
    }

    pub fn is_last_step(&self) -> bool {
        matches!(self.state, FlowState::Collecting(step) if step + 1 == self.step_count())
    }

    /// The question shown at the current step, if it is a question step.
    pub fn current_question(&self) -> Option<&Question> {
        match self.state {
            FlowState::Collecting(step) if step > 0 => self.quiz.questions.get(step - 1),
            _ => None,
        }
    }

    pub fn set_respondent(&mut self, respondent: Respondent) -> Result<(), QuizFlowError> {
        self.ensure_collecting("edit answers")?;
        self.respondent = respondent;
        Ok(())
    }

    pub fn select_option(&mut self, question_id: Uuid, option_id: Uuid) -> Result<(), QuizFlowError> {
        self.ensure_collecting("edit answers")?;
        let question = self.question(question_id)?;
        if !question.options.iter().any(|o| o.id == option_id) {
            return Err(QuizFlowError::UnknownOption {
                question: question_id,
                option: option_id,
            });
        }
        self.answers.insert(question_id, Answer::Choice(option_id));
        Ok(())
    }

    pub fn answer_text(&mut self, question_id: Uuid, text: impl Into<String>) -> Result<(), QuizFlowError> {
        self.ensure_collecting("edit answers")?;
        self.question(question_id)?;
        self.answers.insert(question_id, Answer::Text(text.into()));
        Ok(())
    }

    pub fn is_step_complete(&self, step: usize) -> bool {
        if step == 0 {
            let r = &self.respondent;
            return [&r.name, &r.email, &r.whatsapp]
                .iter()
                .all(|v| !v.trim().is_empty());
        }
        let Some(question) = self.quiz.questions.get(step - 1) else {
            return false;
        };
        match (question.kind, self.answers.get(&question.id)) {
            (QuestionKind::MultipleChoice, Some(Answer::Choice(_))) => true,
            (QuestionKind::ShortText, Some(Answer::Text(text))) => !text.trim().is_empty(),
            _ => false,
        }
    }

    pub fn next(&mut self) -> Result<&FlowState, QuizFlowError> {
        let step = self.ensure_collecting("advance")?;
        if !self.is_step_complete(step) {
            return Err(QuizFlowError::Incomplete);
        }
        if step + 1 >= self.step_count() {
            return Err(QuizFlowError::InvalidState {
                action: "advance",
                state: "final step",
            });
        }
        self.state = FlowState::Collecting(step + 1);
        Ok(&self.state)
    }

    /// Step back. A failed submission returns to the last question.
    pub fn back(&mut self) -> Result<&FlowState, QuizFlowError> {
        self.state = match &self.state {
            FlowState::Collecting(step) => FlowState::Collecting(step.saturating_sub(1)),
            FlowState::Failed(_) => FlowState::Collecting(self.step_count() - 1),
            other => {
                return Err(QuizFlowError::InvalidState {
                    action: "go back",
                    state: other.name(),
                });
            }
        };
        Ok(&self.state)
    }

    /// Sum of the selected options' points. Free text scores nothing.
    pub fn score(&self) -> i32 {
        self.quiz
            .questions
            .iter()
            .filter(|q| q.kind == QuestionKind::MultipleChoice)
            .filter_map(|q| match self.answers.get(&q.id) {
                Some(Answer::Choice(option_id)) => q.options.iter().find(|o| o.id == *option_id),
                _ => None,
            })
            .map(|o| o.points)
            .sum()
    }

    pub fn lead_status(&self) -> LeadStatus {
        LeadStatus::from_score(self.score())
    }

    /// The record written on submit: one answer per answered question.
    pub fn submission(&self) -> QuizSubmission {
        let answers = self
            .quiz
            .questions
            .iter()
            .filter_map(|q| {
                let answer = match (q.kind, self.answers.get(&q.id)?) {
                    (QuestionKind::MultipleChoice, Answer::Choice(id)) => SubmittedAnswer {
                        question_id: q.id,
                        option_id: Some(*id),
                        text_value: None,
                    },
                    (QuestionKind::ShortText, Answer::Text(text)) => SubmittedAnswer {
                        question_id: q.id,
                        option_id: None,
                        text_value: Some(text.trim().to_string()),
                    },
                    _ => return None,
                };
                Some(answer)
            })
            .collect();
        QuizSubmission {
            quiz_id: self.quiz.quiz.id,
            respondent: Respondent {
                name: self.respondent.name.trim().to_string(),
                email: self.respondent.email.trim().to_string(),
                whatsapp: self.respondent.whatsapp.trim().to_string(),
            },
            total_score: self.score(),
            answers,
        }
    }

    /// Write contact, deal, response and answers. Allowed from the last step
    /// or after a failed attempt.
    pub async fn submit(&mut self) -> Result<SubmissionReceipt, QuizFlowError> {
        match self.state {
            FlowState::Collecting(step) if step + 1 == self.step_count() => {}
            FlowState::Failed(_) => {}
            ref other => {
                return Err(QuizFlowError::InvalidState {
                    action: "submit",
                    state: other.name(),
                });
            }
        }
        if !(0..self.step_count()).all(|step| self.is_step_complete(step)) {
            return Err(QuizFlowError::Incomplete);
        }

        self.state = FlowState::Submitting;
        match self.client.submit_response(self.submission()).await {
            Ok(receipt) => {
                self.state = FlowState::Completed(receipt);
                Ok(receipt)
            }
            Err(e) => {
                tracing::warn!(quiz_id = %self.quiz.quiz.id, error = %e, "quiz submission failed");
                self.state = FlowState::Failed(e.to_string());
                Err(e.into())
            }
        }
    }

    fn ensure_collecting(&self, action: &'static str) -> Result<usize, QuizFlowError> {
        match self.state {
            FlowState::Collecting(step) => Ok(step),
            ref other => Err(QuizFlowError::InvalidState {
                action,
                state: other.name(),
            }),
        }
    }

    fn question(&self, id: Uuid) -> Result<&Question, QuizFlowError> {
        self.quiz
            .questions
            .iter()
            .find(|q| q.id == id)
            .ok_or(QuizFlowError::UnknownQuestion(id))
    }
}
