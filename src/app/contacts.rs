//! Client list screen.

use uuid::Uuid;

use crate::client::ContactStore;
use crate::crm::models::{Contact, LeadStatus, NewContact};
use crate::crm::validate;
use crate::errors::CrmError;

pub struct ContactList<C> {
    client: C,
    contacts: Vec<Contact>,
}

impl<C: ContactStore> ContactList<C> {
    pub fn new(client: C) -> Self {
        Self {
            client,
            contacts: Vec::new(),
        }
    }

    /// Newest first.
    pub fn contacts(&self) -> &[Contact] {
        &self.contacts
    }

    pub fn with_status(&self, status: LeadStatus) -> impl Iterator<Item = &Contact> {
        self.contacts.iter().filter(move |c| c.status == status)
    }

    /// Case-insensitive match on name or email.
    pub fn search<'a>(&'a self, query: &str) -> Vec<&'a Contact> {
        let needle = query.trim().to_lowercase();
        self.contacts
            .iter()
            .filter(|c| {
                needle.is_empty()
                    || c.name.to_lowercase().contains(&needle)
                    || c.email
                        .as_deref()
                        .is_some_and(|e| e.to_lowercase().contains(&needle))
            })
            .collect()
    }

    pub async fn load(&mut self) -> Result<&[Contact], CrmError> {
        match self.client.list_contacts().await {
            Ok(contacts) => {
                self.contacts = contacts;
                Ok(&self.contacts)
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to load contacts");
                Err(e)
            }
        }
    }

    pub async fn create(&mut self, contact: NewContact) -> Result<Contact, CrmError> {
        let name = validate::required("Name", &contact.name)?;
        if contact.score < 0 {
            return Err(CrmError::Validation("Score must be a non-negative number".into()));
        }
        let email = validate::optional(contact.email)
            .map(|e| validate::email(&e))
            .transpose()?;
        let created = self
            .client
            .create_contact(NewContact {
                name,
                email,
                ..contact
            })
            .await?;
        self.contacts.insert(0, created.clone());
        Ok(created)
    }

    pub async fn delete(&mut self, id: Uuid) -> Result<(), CrmError> {
        self.client.delete_contact(id).await?;
        self.contacts.retain(|c| c.id != id);
        Ok(())
    }
}
