//! Process-wide services, built once at startup and shared by every connection task.

use std::sync::Arc;

use aden_account_db::AccountStore;
use smol::lock::Semaphore;

use crate::ban_list::BanList;
use crate::config::ServerConfig;
use crate::game_server_table::GameServerTable;
use crate::keys::KeyManager;
use crate::login_controller::LoginController;
use crate::mail::MailSystem;
use crate::status::Notices;

pub struct Services {
    pub config: Arc<ServerConfig>,
    pub store: Arc<dyn AccountStore>,
    pub keys: Arc<KeyManager>,
    pub bans: Arc<BanList>,
    pub game_servers: Arc<GameServerTable>,
    pub controller: Arc<LoginController>,
    pub notices: Notices,
    pub mail: Option<MailSystem>,
    /// Bounds how many decoded packets are handled at once across all connections.
    pub workers: Semaphore,
}

impl Services {
    pub fn new(
        config: Arc<ServerConfig>,
        store: Arc<dyn AccountStore>,
        keys: Arc<KeyManager>,
        bans: Arc<BanList>,
        game_servers: Arc<GameServerTable>,
        mail: Option<MailSystem>,
    ) -> Arc<Self> {
        let controller = Arc::new(LoginController::new(
            config.clone(),
            store.clone(),
            bans.clone(),
            game_servers.clone(),
        ));
        Arc::new(Self {
            workers: Semaphore::new(config.packet_workers),
            config,
            store,
            keys,
            bans,
            game_servers,
            controller,
            notices: Notices::new(),
            mail,
        })
    }

    pub fn mail_enabled(&self) -> bool {
        self.mail.is_some()
    }
}
