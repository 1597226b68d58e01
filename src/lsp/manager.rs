/*
 * Copyright (C) 2026 Mark Wells Dev
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use ignore::WalkBuilder;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use crate::config::{Config, Timeouts};
use crate::error::ClientError;
use crate::lsp::LspClient;
use crate::lsp::binding::{Language, LanguageBinding};
use crate::lsp::documents::path_to_uri;
use crate::lsp::events::ClientEvent;
use crate::lsp::state::ConnectionState;

/// Directory depth searched by [`detect_workspace_languages`].
const LANGUAGE_SCAN_DEPTH: usize = 6;

/// Slack added to the handshake deadline when waiting for a connection.
const CONNECT_SLACK: Duration = Duration::from_secs(1);

/// Owns one client per language and routes work to them.
///
/// Clients are created lazily and never duplicated. Every event they emit is
/// forwarded to one channel, tagged with its language.
pub struct ClientManager {
    config: Config,
    timeouts: Timeouts,
    workspace: Mutex<PathBuf>,
    server_paths: Mutex<HashMap<Language, PathBuf>>,
    clients: Mutex<HashMap<Language, LspClient>>,
    events: mpsc::UnboundedSender<ClientEvent>,
}

impl ClientManager {
    /// Creates a manager that reports to `events`.
    #[must_use]
    pub fn new(config: Config, events: mpsc::UnboundedSender<ClientEvent>) -> Self {
        let workspace = config.workspace_root();
        let timeouts = config.timeouts();
        Self {
            config,
            timeouts,
            workspace: Mutex::new(workspace),
            server_paths: Mutex::new(HashMap::new()),
            clients: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Languages this manager can serve.
    #[must_use]
    pub const fn supported_languages(&self) -> &'static [Language] {
        &Language::ALL
    }

    /// Current workspace root.
    pub async fn workspace(&self) -> PathBuf {
        self.workspace.lock().await.clone()
    }

    /// Returns the client for `language`, creating a disconnected one if
    /// none exists.
    pub async fn ensure_client(&self, language: Language) -> LspClient {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(&language) {
            return client.clone();
        }

        let binding = self.binding(language).await;
        let client = self.create_client(binding);
        clients.insert(language, client.clone());
        drop(clients);

        debug!("Created {language} client");
        client
    }

    /// The existing client for `language`, if any.
    pub async fn client(&self, language: Language) -> Option<LspClient> {
        self.clients.lock().await.get(&language).cloned()
    }

    /// Routes `path` to the client for its language.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::UnsupportedExtension`] for files no binding
    /// handles.
    pub async fn client_for_path(&self, path: &Path) -> Result<LspClient, ClientError> {
        let language = Language::from_path(path)?;
        Ok(self.ensure_client(language).await)
    }

    /// Returns a connected client for `language`, starting or recovering it
    /// as needed.
    ///
    /// # Errors
    ///
    /// Returns the start failure, or a connection error if the handshake
    /// does not complete.
    pub async fn start_client(&self, language: Language) -> Result<LspClient, ClientError> {
        let client = self.ensure_client(language).await;

        match client.state() {
            ConnectionState::Connected => return Ok(client),
            ConnectionState::Starting | ConnectionState::Initializing => {}
            ConnectionState::Error => {
                warn!("{language} server is in error state, restarting");
                client.stop().await?;
                client.start(&self.workspace().await).await?;
            }
            ConnectionState::Disconnected => {
                info!("Starting {language} server");
                client.start(&self.workspace().await).await?;
            }
        }

        client
            .wait_until_connected(self.timeouts.init + CONNECT_SLACK)
            .await?;
        Ok(client)
    }

    /// Opens `path` on the client for its language, starting that client
    /// first if it is not connected. Returns the document URI.
    ///
    /// # Errors
    ///
    /// Returns routing, start, or read failures.
    pub async fn open_file(&self, path: &Path) -> Result<String, ClientError> {
        let language = Language::from_path(path)?;
        let client = self.start_client(language).await?;
        client.open_file(path).await?;
        path_to_uri(path)
    }

    /// Changes the workspace root. Running clients are restarted under it.
    ///
    /// # Errors
    ///
    /// Returns the first restart failure.
    pub async fn set_workspace(&self, root: PathBuf) -> Result<(), ClientError> {
        info!("Workspace set to {}", root.display());
        *self.workspace.lock().await = root.clone();

        for client in self.running_clients().await {
            client.stop().await?;
            client.start(&root).await?;
        }
        Ok(())
    }

    /// Overrides the server location for `language`, or clears the override
    /// with `None`. A running client is restarted with the new binding.
    ///
    /// # Errors
    ///
    /// Returns the restart failure.
    pub async fn set_server_path(
        &self,
        language: Language,
        path: Option<PathBuf>,
    ) -> Result<(), ClientError> {
        {
            let mut paths = self.server_paths.lock().await;
            match path {
                Some(path) => {
                    paths.insert(language, path);
                }
                None => {
                    paths.remove(&language);
                }
            }
        }

        let Some(client) = self.client(language).await else {
            return Ok(());
        };
        client.set_binding(self.binding(language).await).await?;
        if client.state().is_running() {
            info!("Restarting {language} server with new path");
            client.stop().await?;
            client.start(&self.workspace().await).await?;
        }
        Ok(())
    }

    /// Stops and forgets the client for `language`. Returns whether one
    /// existed.
    pub async fn remove_client(&self, language: Language) -> bool {
        let removed = self.clients.lock().await.remove(&language);
        let Some(client) = removed else {
            return false;
        };
        if let Err(e) = client.stop().await {
            warn!("Failed to stop {language} server: {e}");
        }
        true
    }

    /// Stops every client.
    pub async fn shutdown_all(&self) {
        let clients: Vec<(Language, LspClient)> = self.clients.lock().await.drain().collect();
        for (language, client) in clients {
            if let Err(e) = client.stop().await {
                warn!("Failed to stop {language} server: {e}");
            }
        }
    }

    /// Number of clients whose server is running.
    pub async fn active_clients_count(&self) -> usize {
        self.running_clients().await.len()
    }

    /// Whether the client for `language` has a running server.
    pub async fn has_active_client(&self, language: Language) -> bool {
        self.client(language)
            .await
            .is_some_and(|c| c.state().is_running())
    }

    /// Languages that currently have a client, running or not.
    pub async fn languages(&self) -> Vec<Language> {
        let mut languages: Vec<Language> = self.clients.lock().await.keys().copied().collect();
        languages.sort();
        languages
    }

    async fn running_clients(&self) -> Vec<LspClient> {
        self.clients
            .lock()
            .await
            .values()
            .filter(|c| c.state().is_running())
            .cloned()
            .collect()
    }

    async fn binding(&self, language: Language) -> LanguageBinding {
        let mut binding = self.config.binding(language);
        if let Some(path) = self.server_paths.lock().await.get(&language) {
            binding.set_server_path(Some(path.clone()));
        }
        binding
    }

    fn create_client(&self, binding: LanguageBinding) -> LspClient {
        let language = binding.language();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = LspClient::new(binding, self.timeouts, tx);

        let events = self.events.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if events.send(ClientEvent { language, event }).is_err() {
                    break;
                }
            }
        });
        client
    }
}

/// Detects which supported languages appear under `roots`.
///
/// Honors `.gitignore` and skips hidden entries.
#[must_use]
pub fn detect_workspace_languages(roots: &[PathBuf]) -> BTreeSet<Language> {
    let mut detected = BTreeSet::new();

    for root in roots {
        if !root.exists() {
            continue;
        }

        let walker = WalkBuilder::new(root)
            .max_depth(Some(LANGUAGE_SCAN_DEPTH))
            .git_ignore(true)
            .require_git(false)
            .hidden(true)
            .build();

        for entry in walker.flatten() {
            if let Some(language) = entry
                .path()
                .extension()
                .and_then(|e| e.to_str())
                .and_then(Language::from_extension)
            {
                detected.insert(language);
                if detected.len() == Language::ALL.len() {
                    return detected;
                }
            }
        }
    }

    detected
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (ClientManager, mpsc::UnboundedReceiver<ClientEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ClientManager::new(Config::default(), tx), rx)
    }

    #[tokio::test]
    async fn test_ensure_client_is_idempotent() {
        let (manager, _rx) = manager();
        let first = manager.ensure_client(Language::Cpp).await;
        let _second = manager.ensure_client(Language::Cpp).await;
        assert_eq!(first.language(), Language::Cpp);
        assert_eq!(manager.languages().await, vec![Language::Cpp]);
        assert_eq!(manager.active_clients_count().await, 0);
        assert!(!manager.has_active_client(Language::Cpp).await);
    }

    #[tokio::test]
    async fn test_routes_by_extension() -> anyhow::Result<()> {
        let (manager, _rx) = manager();
        assert_eq!(
            manager.client_for_path(Path::new("src/Main.java")).await?.language(),
            Language::Java
        );
        assert_eq!(
            manager.client_for_path(Path::new("widget.HPP")).await?.language(),
            Language::Cpp
        );
        assert!(matches!(
            manager.client_for_path(Path::new("lib.rs")).await,
            Err(ClientError::UnsupportedExtension(_))
        ));
        assert_eq!(manager.languages().await, vec![Language::Cpp, Language::Java]);
        Ok(())
    }

    #[tokio::test]
    async fn test_remove_client() {
        let (manager, _rx) = manager();
        manager.ensure_client(Language::Java).await;
        assert!(manager.remove_client(Language::Java).await);
        assert!(!manager.remove_client(Language::Java).await);
        assert!(manager.languages().await.is_empty());
    }

    #[tokio::test]
    async fn test_start_failure_is_tagged() -> anyhow::Result<()> {
        let (manager, mut rx) = manager();
        manager
            .set_server_path(Language::Cpp, Some(PathBuf::from("/definitely/not/clangd")))
            .await?;

        let dir = tempfile::tempdir()?;
        let file = dir.path().join("main.cpp");
        std::fs::write(&file, "int main() {}")?;
        assert!(manager.open_file(&file).await.is_err());

        let event = rx.recv().await;
        assert!(matches!(event, Some(ClientEvent { language: Language::Cpp, .. })));
        Ok(())
    }

    #[test]
    fn test_detect_workspace_languages() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::create_dir_all(dir.path().join("src"))?;
        std::fs::create_dir_all(dir.path().join("build"))?;
        std::fs::write(dir.path().join("src/main.cpp"), "")?;
        std::fs::write(dir.path().join("build/Gen.java"), "")?;
        std::fs::write(dir.path().join(".gitignore"), "build/\n")?;

        let detected = detect_workspace_languages(&[dir.path().to_path_buf()]);
        assert_eq!(detected.into_iter().collect::<Vec<_>>(), vec![Language::Cpp]);
        Ok(())
    }

    #[test]
    fn test_detect_skips_missing_roots() {
        assert!(detect_workspace_languages(&[PathBuf::from("/no/such/root")]).is_empty());
    }
}
