//! Theme preference, kept in a local JSON file and on the user's profile.
//!
//! The profile is authoritative: on load it overrides the local copy and is
//! written back to it. Every change goes to both places.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::client::ProfileStore;
use crate::crm::models::{Profile, ThemeMode, ThemeStyle};
use crate::errors::CrmError;

const PREFS_FILE: &str = "prefs.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ThemePreference {
    pub theme_mode: ThemeMode,
    pub theme_style: ThemeStyle,
}

/// Per-machine preference file.
#[derive(Debug, Clone)]
pub struct LocalPrefs {
    path: PathBuf,
}

impl LocalPrefs {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<config dir>/agencyflow/prefs.json`, if the platform has one.
    pub fn default_location() -> Option<Self> {
        dirs::config_dir().map(|dir| Self::new(dir.join("agencyflow").join(PREFS_FILE)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read(&self) -> Result<Option<ThemePreference>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        let prefs = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", self.path.display()))?;
        Ok(Some(prefs))
    }

    pub fn write(&self, prefs: &ThemePreference) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content = serde_json::to_string_pretty(prefs).context("Failed to serialize preferences")?;
        std::fs::write(&self.path, content)
            .with_context(|| format!("Failed to write {}", self.path.display()))
    }
}

pub struct ThemeSettings<C> {
    client: C,
    prefs: LocalPrefs,
    current: ThemePreference,
    profile: Option<Profile>,
}

impl<C: ProfileStore> ThemeSettings<C> {
    pub fn new(client: C, prefs: LocalPrefs) -> Self {
        Self {
            client,
            prefs,
            current: ThemePreference::default(),
            profile: None,
        }
    }

    pub fn current(&self) -> ThemePreference {
        self.current
    }

    pub fn mode(&self) -> ThemeMode {
        self.current.theme_mode
    }

    pub fn style(&self) -> ThemeStyle {
        self.current.theme_style
    }

    pub fn profile(&self) -> Option<&Profile> {
        self.profile.as_ref()
    }

    /// Local file first, then the profile.
    pub async fn load(&mut self) -> ThemePreference {
        match self.prefs.read() {
            Ok(Some(local)) => self.current = local,
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "ignoring unreadable theme preferences"),
        }
        match self.client.get_profile().await {
            Ok(Some(profile)) => {
                self.current = ThemePreference {
                    theme_mode: profile.theme_mode,
                    theme_style: profile.theme_style,
                };
                self.profile = Some(profile);
                self.write_local();
            }
            Ok(None) => {}
            Err(e) => tracing::debug!(error = %e, "no profile theme, using local preference"),
        }
        self.current
    }

    pub async fn set_mode(&mut self, mode: ThemeMode) -> Result<(), CrmError> {
        self.apply(ThemePreference {
            theme_mode: mode,
            ..self.current
        })
        .await
    }

    pub async fn set_style(&mut self, style: ThemeStyle) -> Result<(), CrmError> {
        self.apply(ThemePreference {
            theme_style: style,
            ..self.current
        })
        .await
    }

    pub async fn toggle_mode(&mut self) -> Result<ThemeMode, CrmError> {
        let mode = match self.current.theme_mode {
            ThemeMode::Dark => ThemeMode::Light,
            ThemeMode::Light => ThemeMode::Dark,
        };
        self.set_mode(mode).await?;
        Ok(mode)
    }

    /// Upsert the full profile. Unlike theme changes, failure is returned.
    pub async fn save_settings(&mut self, avatar_url: Option<String>) -> Result<Profile, CrmError> {
        let profile = Profile {
            avatar_url,
            ..self.profile_draft()
        };
        let saved = self.client.upsert_profile(profile).await?;
        self.profile = Some(saved.clone());
        Ok(saved)
    }

    async fn apply(&mut self, next: ThemePreference) -> Result<(), CrmError> {
        self.current = next;
        self.write_local();
        let result = match self
            .client
            .update_theme(next.theme_mode, next.theme_style)
            .await
        {
            Ok(true) => Ok(()),
            Ok(false) => self
                .client
                .upsert_profile(self.profile_draft())
                .await
                .map(|saved| self.profile = Some(saved)),
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            tracing::warn!(error = %e, "failed to store theme on profile");
        }
        result
    }

    fn profile_draft(&self) -> Profile {
        let base = self.profile.clone();
        Profile {
            id: base.as_ref().map(|p| p.id).unwrap_or_else(Uuid::nil),
            theme_mode: self.current.theme_mode,
            theme_style: self.current.theme_style,
            avatar_url: base.as_ref().and_then(|p| p.avatar_url.clone()),
            updated_at: None,
        }
    }

    fn write_local(&self) {
        if let Err(e) = self.prefs.write(&self.current) {
            tracing::warn!(error = %e, "failed to save theme preferences");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::local::tests::seeded;
    use tempfile::TempDir;

    fn prefs_in(dir: &TempDir) -> LocalPrefs {
        LocalPrefs::new(dir.path().join("nested").join(PREFS_FILE))
    }

    #[tokio::test]
    async fn test_defaults_without_file_or_profile() {
        let dir = TempDir::new().unwrap();
        let (_, owner, _) = seeded();
        let mut theme = ThemeSettings::new(owner, prefs_in(&dir));
        let loaded = theme.load().await;
        assert_eq!(loaded.theme_mode, ThemeMode::Dark);
        assert_eq!(loaded.theme_style, ThemeStyle::Retro);
    }

    #[tokio::test]
    async fn test_change_writes_file_and_creates_profile() {
        let dir = TempDir::new().unwrap();
        let (_, owner, user) = seeded();
        let mut theme = ThemeSettings::new(owner.clone(), prefs_in(&dir));
        theme.load().await;

        theme.set_style(ThemeStyle::Minimalist).await.unwrap();
        assert_eq!(theme.toggle_mode().await.unwrap(), ThemeMode::Light);

        let local = prefs_in(&dir).read().unwrap().unwrap();
        assert_eq!(local.theme_mode, ThemeMode::Light);
        assert_eq!(local.theme_style, ThemeStyle::Minimalist);

        let profile = owner.get_profile().await.unwrap().unwrap();
        assert_eq!(profile.id, user.id);
        assert_eq!(profile.theme_mode, ThemeMode::Light);
        assert_eq!(profile.theme_style, ThemeStyle::Minimalist);
    }

    #[tokio::test]
    async fn test_profile_wins_over_local_file() {
        let dir = TempDir::new().unwrap();
        let prefs = prefs_in(&dir);
        prefs
            .write(&ThemePreference {
                theme_mode: ThemeMode::Dark,
                theme_style: ThemeStyle::Retro,
            })
            .unwrap();
        let (_, owner, user) = seeded();
        owner
            .upsert_profile(Profile {
                id: user.id,
                theme_mode: ThemeMode::Light,
                theme_style: ThemeStyle::Minimalist,
                avatar_url: None,
                updated_at: None,
            })
            .await
            .unwrap();

        let mut theme = ThemeSettings::new(owner, prefs.clone());
        let loaded = theme.load().await;
        assert_eq!(loaded.theme_mode, ThemeMode::Light);
        assert_eq!(prefs.read().unwrap().unwrap(), loaded);
    }

    #[tokio::test]
    async fn test_anonymous_keeps_local_and_reports_failure() {
        let dir = TempDir::new().unwrap();
        let prefs = prefs_in(&dir);
        prefs
            .write(&ThemePreference {
                theme_mode: ThemeMode::Light,
                theme_style: ThemeStyle::Retro,
            })
            .unwrap();
        let (anon, _, _) = seeded();
        let mut theme = ThemeSettings::new(anon, prefs.clone());
        assert_eq!(theme.load().await.theme_mode, ThemeMode::Light);

        assert!(matches!(theme.set_mode(ThemeMode::Dark).await, Err(CrmError::Unauthorized)));
        // the local copy still changes
        assert_eq!(prefs.read().unwrap().unwrap().theme_mode, ThemeMode::Dark);
        assert!(theme.save_settings(None).await.is_err());
    }

    #[tokio::test]
    async fn test_save_settings_upserts_avatar() {
        let dir = TempDir::new().unwrap();
        let (_, owner, _) = seeded();
        let mut theme = ThemeSettings::new(owner, prefs_in(&dir));
        theme.load().await;
        let saved = theme
            .save_settings(Some("https://cdn.test/a.png".into()))
            .await
            .unwrap();
        assert_eq!(saved.avatar_url.as_deref(), Some("https://cdn.test/a.png"));
        assert_eq!(theme.profile().unwrap().avatar_url, saved.avatar_url);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let prefs = LocalPrefs::new(dir.path().join(PREFS_FILE));
        std::fs::write(prefs.path(), "{not json").unwrap();
        assert!(prefs.read().is_err());
    }
}
