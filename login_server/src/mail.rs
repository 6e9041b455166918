//! Templated account mail requested by game servers.
//!
//! Templates are `<mail id>.html` files; the first line is the subject, the rest the body.
//! Server-wide placeholders are filled in at load time, per-mail ones when sending. There is no
//! SMTP transport here, so a rendered mail is handed to the log.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use aden_account_db::AccountStore;
use anyhow::Result;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailContent {
    pub subject: String,
    pub body: String,
}

pub struct MailSystem {
    templates: HashMap<String, MailContent>,
    store: Arc<dyn AccountStore>,
}

impl MailSystem {
    pub fn load(dir: &Path, server_name: &str, server_address: &str, store: Arc<dyn AccountStore>) -> Result<Self> {
        let mut templates = HashMap::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("html") {
                continue;
            }
            let Some(mail_id) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                continue;
            };
            match std::fs::read_to_string(&path) {
                Ok(raw) => {
                    templates.insert(mail_id, parse_template(&raw, server_name, server_address));
                }
                Err(e) => warn!("There has been an error while reading {}: {e}", path.display()),
            }
        }
        info!("Email system loaded {} templates", templates.len());
        Ok(Self { templates, store })
    }

    pub fn render(&self, mail_id: &str, account: &str, args: &[String]) -> Option<MailContent> {
        let template = self.templates.get(mail_id)?;
        let mut body = template.body.clone();
        for (i, arg) in args.iter().enumerate() {
            body = body.replace(&format!("%var{i}%"), arg);
        }
        Some(MailContent {
            subject: template.subject.clone(),
            body: body.replace("%accountname%", account),
        })
    }

    /// Looks up the account's address and renders the mail into the log. Nothing is sent over
    /// SMTP. Missing addresses and unknown templates are skipped quietly.
    pub async fn send_mail(&self, account: &str, mail_id: &str, args: &[String]) -> Option<MailContent> {
        let address = match self.store.user_email(account).await {
            Ok(Some(address)) => address,
            Ok(None) => return None,
            Err(e) => {
                warn!("Cannot select user mail of '{account}': {e}");
                return None;
            }
        };
        let Some(mail) = self.render(mail_id, account, args) else {
            warn!("Unknown mail template {mail_id}");
            return None;
        };
        info!("Mail '{}' for {account} rendered for {address} (not sent, no SMTP transport)", mail.subject);
        Some(mail)
    }
}

fn parse_template(raw: &str, server_name: &str, server_address: &str) -> MailContent {
    let raw = raw.replace("\r\n", "\n");
    let (subject, body) = raw.split_once('\n').unwrap_or((raw.as_str(), ""));
    MailContent {
        subject: subject.trim().to_string(),
        body: body
            .replace("%servermail%", server_address)
            .replace("%servername%", server_name),
    }
}
