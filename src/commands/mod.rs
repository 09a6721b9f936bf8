//! Chat command surface on top of the bottle store and the cloud bridge.

pub mod conversation;
pub mod view;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::avatar::avatar_url;
use crate::bottles::{BottleId, BottleStore, CommentRemoval, Draft, Requester};
use crate::cloud::{BotIdentity, CloudBottle, CloudBridge, CloudError, CloudId};
use crate::cooling::{ActionKind, CoolingGate};
use crate::error::BottleError;

pub use conversation::{Conversation, IncomingContent, Reply};
pub use view::{BottleView, PlainRenderer, Renderer};

pub const CONTENT_PROMPT_TIMEOUT: Duration = Duration::from_secs(20);
pub const IMAGE_PROMPT_TIMEOUT: Duration = Duration::from_secs(10);
pub const TITLE_PROMPT_TIMEOUT: Duration = Duration::from_secs(20);
pub const INDEX_PROMPT_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Throw(Option<IncomingContent>),
    Retrieve(Option<BottleId>),
    Comment(BottleId, IncomingContent),
    Hide(BottleId),
    Unhide(BottleId),
    DeleteComments(BottleId),
    Stats,
    Activity,
    History,
    CloudThrow(Option<IncomingContent>),
    CloudRetrieve(Option<u64>),
    CloudComment(String, IncomingContent),
    CloudExport,
    Help,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("Unknown command: {0}")]
    Unknown(String),

    #[error("Usage: {0}")]
    Usage(&'static str),

    #[error("Not a bottle id: {0}")]
    InvalidId(String),
}

pub const HELP: &str = "\
throw [content]            throw a bottle into the sea
retrieve [id]              retrieve a random bottle, or one you have seen before
comment <id> <content>     comment on a bottle you have retrieved
hide <id> / unhide <id>    hide or show a bottle (admins)
delete-comments <id>       remove comments from a bottle
stats                      bottle statistics
log                        your activity log
history                    bottles you have retrieved
cloud-throw [content]      throw a bottle into the cloud sea
cloud-retrieve [id]        retrieve a cloud bottle
cloud-comment <id> <text>  comment on a cloud bottle
cloud-export               copy local bottles to the cloud (admins)";

/// Parse one user message into a command. The first word names the command.
pub fn parse_command(message: &IncomingContent) -> Result<Command, CommandError> {
    let text = message.text.trim();
    let (name, rest) = match text.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim()),
        None => (text, ""),
    };
    let args = IncomingContent {
        text: rest.to_string(),
        images: message.images.clone(),
        audio: message.audio.clone(),
    };
    let inline = (!args.is_empty()).then(|| args.clone());

    match name.to_ascii_lowercase().as_str() {
        "throw" => Ok(Command::Throw(inline)),
        "retrieve" | "scoop" => Ok(Command::Retrieve(optional_id(rest)?)),
        "comment" => {
            let (id, body) = id_and_body(&args, "comment <id> <content>")?;
            Ok(Command::Comment(parse_id(id)?, body))
        }
        "hide" => Ok(Command::Hide(required_id(rest, "hide <id>")?)),
        "unhide" => Ok(Command::Unhide(required_id(rest, "unhide <id>")?)),
        "delete-comments" => Ok(Command::DeleteComments(required_id(rest, "delete-comments <id>")?)),
        "stats" => Ok(Command::Stats),
        "log" | "activity" => Ok(Command::Activity),
        "history" => Ok(Command::History),
        "cloud-throw" => Ok(Command::CloudThrow(inline)),
        "cloud-retrieve" => Ok(Command::CloudRetrieve(optional_id(rest)?)),
        "cloud-comment" => {
            let (id, body) = id_and_body(&args, "cloud-comment <id> <text>")?;
            Ok(Command::CloudComment(id.to_string(), body))
        }
        "cloud-export" => Ok(Command::CloudExport),
        "help" => Ok(Command::Help),
        other => Err(CommandError::Unknown(other.to_string())),
    }
}

fn parse_id(raw: &str) -> Result<BottleId, CommandError> {
    raw.trim()
        .trim_start_matches('#')
        .parse()
        .map_err(|_| CommandError::InvalidId(raw.to_string()))
}

/// Id for a retrieval; a missing id or `0` asks for a random bottle.
fn optional_id(rest: &str) -> Result<Option<BottleId>, CommandError> {
    match rest.split_whitespace().next() {
        Some(raw) => parse_id(raw).map(|id| (id != 0).then_some(id)),
        None => Ok(None),
    }
}

fn required_id(rest: &str, usage: &'static str) -> Result<BottleId, CommandError> {
    let raw = rest.split_whitespace().next().ok_or(CommandError::Usage(usage))?;
    parse_id(raw)
}

fn id_and_body<'a>(
    args: &'a IncomingContent,
    usage: &'static str,
) -> Result<(&'a str, IncomingContent), CommandError> {
    let (id, text) = match args.text.split_once(char::is_whitespace) {
        Some((id, text)) => (id, text.trim()),
        None => (args.text.as_str(), ""),
    };
    if id.is_empty() {
        return Err(CommandError::Usage(usage));
    }
    Ok((
        id,
        IncomingContent {
            text: text.to_string(),
            images: args.images.clone(),
            audio: args.audio.clone(),
        },
    ))
}

/// Parse "1, 3，4 x" into the numbers it contains.
pub fn parse_indices(input: &str) -> Vec<usize> {
    input
        .split(|c: char| c == ',' || c == '，' || c.is_whitespace())
        .filter_map(|part| part.trim().parse().ok())
        .collect()
}

/// Who is talking, and through which bot.
#[derive(Debug, Clone)]
pub struct Session {
    pub user: Requester,
    pub platform: String,
    /// The bot's own user id on the platform
    pub self_id: String,
    pub bot_avatar: Option<String>,
}

#[derive(Debug, Clone)]
pub struct HandlerSettings {
    pub bot_id: String,
    pub style: u8,
    pub page_size: usize,
    pub author_can_delete_comments: bool,
    pub onebot_avatars: bool,
}

pub struct CommandHandler {
    store: Arc<BottleStore>,
    cooling: Arc<CoolingGate>,
    cloud: Option<Arc<CloudBridge>>,
    renderer: Arc<dyn Renderer>,
    settings: HandlerSettings,
}

impl CommandHandler {
    pub fn new(
        store: Arc<BottleStore>,
        cooling: Arc<CoolingGate>,
        cloud: Option<Arc<CloudBridge>>,
        renderer: Arc<dyn Renderer>,
        settings: HandlerSettings,
    ) -> Self {
        Self {
            store,
            cooling,
            cloud,
            renderer,
            settings,
        }
    }

    pub async fn handle(
        &self,
        session: &Session,
        conv: &mut dyn Conversation,
        command: Command,
    ) -> anyhow::Result<()> {
        match command {
            Command::Throw(inline) => self.throw(session, conv, inline).await,
            Command::Retrieve(id) => self.retrieve(session, conv, id).await,
            Command::Comment(id, content) => self.comment(session, conv, id, content).await,
            Command::Hide(id) => self.set_visibility(session, conv, id, false).await,
            Command::Unhide(id) => self.set_visibility(session, conv, id, true).await,
            Command::DeleteComments(id) => self.delete_comments(session, conv, id).await,
            Command::Stats => {
                let summary = self.store.summarize(&session.user.id).await;
                conv.send(Reply::Text(summary.to_string())).await
            }
            Command::Activity => self.activity(session, conv).await,
            Command::History => self.history(session, conv).await,
            Command::CloudThrow(inline) => self.cloud_throw(session, conv, inline).await,
            Command::CloudRetrieve(id) => self.cloud_retrieve(session, conv, id).await,
            Command::CloudComment(id, content) => self.cloud_comment(session, conv, id, content).await,
            Command::CloudExport => self.cloud_export(session, conv).await,
            Command::Help => conv.send(Reply::text(HELP)).await,
        }
    }

    async fn throw(
        &self,
        session: &Session,
        conv: &mut dyn Conversation,
        inline: Option<IncomingContent>,
    ) -> anyhow::Result<()> {
        if !self.cool_down(session, conv, ActionKind::Throw).await? {
            return Ok(());
        }
        let Some(draft) = collect_draft(conv, inline).await? else {
            return Ok(());
        };

        match self.store.create(&session.user, draft).await {
            Ok(created) => {
                if created.filtered_images > 0 {
                    conv.send(Reply::Text(format!(
                        "{} image(s) were filtered before submission.",
                        created.filtered_images
                    )))
                    .await?;
                }
                conv.send(Reply::Text(format!(
                    "Your {} bottle #{} is out to sea.",
                    created.kind, created.id
                )))
                .await
            }
            Err(e) => self.report(conv, e).await,
        }
    }

    async fn retrieve(&self, session: &Session, conv: &mut dyn Conversation, id: Option<BottleId>) -> anyhow::Result<()> {
        if !self.cool_down(session, conv, ActionKind::Retrieve).await? {
            return Ok(());
        }

        let result = match id {
            Some(id) => self.store.retrieve_by_id(&session.user, id).await,
            None => self.store.retrieve_random(&session.user).await,
        };
        let bottle = match result {
            Ok(bottle) => bottle,
            Err(e) => return self.report(conv, e).await,
        };

        if bottle.is_audio() {
            if let Some(title) = &bottle.content.title {
                conv.send(Reply::Text(format!("Bottle #{}: {}", bottle.id, title))).await?;
            }
            if let Some(first) = bottle.content.audio.iter().flatten().next() {
                conv.send(Reply::Audio(first.clone())).await?;
            }
            return Ok(());
        }

        let view = BottleView::from_bottle(&bottle, |user| self.avatar_for(session, user));
        self.present(conv, &view).await?;
        conv.send(Reply::Text(format!(
            "Reply with \"comment {} <content>\" to leave a comment.",
            bottle.id
        )))
        .await
    }

    async fn comment(
        &self,
        session: &Session,
        conv: &mut dyn Conversation,
        id: BottleId,
        content: IncomingContent,
    ) -> anyhow::Result<()> {
        if !self.cool_down(session, conv, ActionKind::Comment).await? {
            return Ok(());
        }

        let draft = Draft {
            text: Some(content.text).filter(|t| !t.trim().is_empty()),
            images: content.images,
            ..Draft::default()
        };
        match self.store.add_comment(&session.user, id, draft).await {
            Ok(position) => {
                conv.send(Reply::Text(format!("Comment #{} added to bottle #{}.", position, id)))
                    .await
            }
            Err(e) => self.report(conv, e).await,
        }
    }

    async fn set_visibility(
        &self,
        session: &Session,
        conv: &mut dyn Conversation,
        id: BottleId,
        visible: bool,
    ) -> anyhow::Result<()> {
        match self.store.set_visibility(&session.user, id, visible).await {
            Ok(()) => {
                let state = if visible { "visible again" } else { "hidden" };
                conv.send(Reply::Text(format!("Bottle #{} is now {}.", id, state))).await
            }
            Err(e) => self.report(conv, e).await,
        }
    }

    async fn delete_comments(&self, session: &Session, conv: &mut dyn Conversation, id: BottleId) -> anyhow::Result<()> {
        let user = &session.user;
        if !user.is_admin && !self.settings.author_can_delete_comments {
            return self.report(conv, BottleError::Forbidden).await;
        }

        conv.send(Reply::text(
            "Which comments should be removed? Send their numbers separated by commas.",
        ))
        .await?;
        let Some(answer) = conv.prompt(INDEX_PROMPT_TIMEOUT).await else {
            return conv.send(Reply::text("No answer, nothing was removed.")).await;
        };
        let indices = parse_indices(&answer.text);
        if indices.is_empty() {
            return conv.send(Reply::text("No comment numbers given, nothing was removed.")).await;
        }

        let outcomes = match self
            .store
            .delete_comments(user, id, &indices, self.settings.author_can_delete_comments)
            .await
        {
            Ok(outcomes) => outcomes,
            Err(e) => return self.report(conv, e).await,
        };

        if outcomes.is_empty() {
            return conv.send(Reply::text("None of those comments exist.")).await;
        }
        let lines: Vec<String> = outcomes
            .iter()
            .map(|outcome| match outcome {
                CommentRemoval::Removed(n) => format!("Comment #{} removed.", n),
                CommentRemoval::AlreadyRemoved(n) => format!("Comment #{} was already removed.", n),
            })
            .collect();
        conv.send(Reply::Text(lines.join("\n"))).await
    }

    async fn activity(&self, session: &Session, conv: &mut dyn Conversation) -> anyhow::Result<()> {
        let log = self.store.activity();
        // Counted before listing, which marks everything as seen
        let unseen = match log.unseen_count(&session.user.id).await {
            Ok(unseen) => unseen,
            Err(e) => return self.report(conv, e.into()).await,
        };
        let events = match log.list(&session.user.id, self.settings.page_size).await {
            Ok(events) => events,
            Err(e) => return self.report(conv, e.into()).await,
        };

        if unseen > 0 {
            conv.send(Reply::text(format!("You have {} new event(s).", unseen))).await?;
        }

        if events.is_empty() {
            return conv.send(Reply::text("Your activity log is empty.")).await;
        }
        let lines: Vec<String> = events
            .iter()
            .map(|event| {
                let marker = if event.unseen { "[new] " } else { "" };
                format!(
                    "{}{} {}",
                    marker,
                    event.timestamp.format("%Y-%m-%d %H:%M"),
                    event.description
                )
            })
            .collect();
        conv.send(Reply::Text(lines.join("\n"))).await
    }

    async fn history(&self, session: &Session, conv: &mut dyn Conversation) -> anyhow::Result<()> {
        let items = self.store.history(&session.user.id).await;
        if items.is_empty() {
            return conv.send(Reply::text("You have not retrieved any bottles yet.")).await;
        }
        let lines: Vec<String> = items
            .iter()
            .rev()
            .map(|item| {
                let label = item.kind.map(|kind| kind.label()).unwrap_or("missing");
                format!("#{} {}", item.id, label)
            })
            .collect();
        conv.send(Reply::Text(lines.join("\n"))).await
    }

    async fn cloud_throw(
        &self,
        session: &Session,
        conv: &mut dyn Conversation,
        inline: Option<IncomingContent>,
    ) -> anyhow::Result<()> {
        let Some((cloud, bot)) = self.cloud_for(session, conv).await? else {
            return Ok(());
        };
        if !self.cool_down(session, conv, ActionKind::Throw).await? {
            return Ok(());
        }
        let Some(draft) = collect_draft(conv, inline).await? else {
            return Ok(());
        };
        if !draft.audio.is_empty() {
            return conv.send(Reply::text("Cloud bottles cannot carry audio.")).await;
        }

        match cloud.throw(&bot, &session.user, draft).await {
            Ok(thrown) => {
                if thrown.filtered_images > 0 {
                    conv.send(Reply::Text(format!(
                        "{} image(s) were filtered before submission.",
                        thrown.filtered_images
                    )))
                    .await?;
                }
                conv.send(Reply::Text(format!("Your cloud bottle #{} is out to sea.", thrown.id)))
                    .await
            }
            Err(e) => self.report_cloud(conv, e).await,
        }
    }

    async fn cloud_retrieve(&self, session: &Session, conv: &mut dyn Conversation, id: Option<u64>) -> anyhow::Result<()> {
        let Some((cloud, bot)) = self.cloud_for(session, conv).await? else {
            return Ok(());
        };
        if !self.cool_down(session, conv, ActionKind::Retrieve).await? {
            return Ok(());
        }

        let bottle: CloudBottle = match cloud.retrieve(&bot, id).await {
            Ok(bottle) => bottle,
            Err(e) => return self.report_cloud(conv, e).await,
        };
        let view = BottleView::from_cloud(&bottle, self.settings.style);
        self.present(conv, &view).await?;
        conv.send(Reply::Text(format!(
            "Reply with \"cloud-comment {} <text>\" to leave a comment.",
            bottle.id
        )))
        .await
    }

    async fn cloud_comment(
        &self,
        session: &Session,
        conv: &mut dyn Conversation,
        id: String,
        content: IncomingContent,
    ) -> anyhow::Result<()> {
        let Some((cloud, bot)) = self.cloud_for(session, conv).await? else {
            return Ok(());
        };
        if !self.cool_down(session, conv, ActionKind::Comment).await? {
            return Ok(());
        }

        let bottle_id = match id.parse::<u64>() {
            Ok(n) => CloudId::Number(n),
            Err(_) => CloudId::Text(id),
        };
        match cloud.comment(&bot, &session.user, bottle_id, &content.text).await {
            Ok(message) if message.is_empty() => conv.send(Reply::text("Comment sent.")).await,
            Ok(message) => conv.send(Reply::Text(message)).await,
            Err(e) => self.report_cloud(conv, e).await,
        }
    }

    async fn cloud_export(&self, session: &Session, conv: &mut dyn Conversation) -> anyhow::Result<()> {
        let Some((cloud, bot)) = self.cloud_for(session, conv).await? else {
            return Ok(());
        };
        if !session.user.is_admin {
            return self.report_cloud(conv, CloudError::Forbidden).await;
        }

        let bottles = self.store.all_bottles().await;
        match cloud.export(&bot, &session.user, &bottles).await {
            Ok(report) => {
                conv.send(Reply::Text(format!(
                    "Exported {} bottle(s). {} already exported, {} audio bottle(s) skipped, {} failed.",
                    report.exported.len(),
                    report.already_exported,
                    report.skipped_audio,
                    report.failed
                )))
                .await
            }
            Err(e) => self.report_cloud(conv, e).await,
        }
    }

    /// Stamp the cooldown, telling the user how long to wait when blocked.
    async fn cool_down(&self, session: &Session, conv: &mut dyn Conversation, kind: ActionKind) -> anyhow::Result<bool> {
        let verdict = self.cooling.check_and_stamp(&session.user.id, kind);
        if !verdict.allowed {
            conv.send(Reply::Text(format!(
                "Cooling down, try again in {} second(s).",
                verdict.remaining_secs()
            )))
            .await?;
        }
        Ok(verdict.allowed)
    }

    async fn cloud_for(
        &self,
        session: &Session,
        conv: &mut dyn Conversation,
    ) -> anyhow::Result<Option<(Arc<CloudBridge>, BotIdentity)>> {
        let Some(cloud) = &self.cloud else {
            conv.send(Reply::text("Cloud bottles are disabled.")).await?;
            return Ok(None);
        };
        match BotIdentity::resolve(&session.platform, &session.self_id, session.bot_avatar.as_deref()) {
            Ok(bot) => Ok(Some((cloud.clone(), bot))),
            Err(e) => {
                self.report_cloud(conv, e).await?;
                Ok(None)
            }
        }
    }

    async fn present(&self, conv: &mut dyn Conversation, view: &BottleView) -> anyhow::Result<()> {
        for reply in self.renderer.render(view).await? {
            conv.send(reply).await?;
        }
        Ok(())
    }

    fn avatar_for(&self, session: &Session, user_id: &str) -> String {
        avatar_url(
            &session.platform,
            &self.settings.bot_id,
            user_id,
            self.settings.onebot_avatars,
        )
    }

    async fn report(&self, conv: &mut dyn Conversation, error: BottleError) -> anyhow::Result<()> {
        if !error.is_fault() {
            tracing::debug!("Command rejected: {}", error);
        }
        conv.send(Reply::Text(error.user_message())).await
    }

    async fn report_cloud(&self, conv: &mut dyn Conversation, error: CloudError) -> anyhow::Result<()> {
        let message = match &error {
            CloudError::Rejected(message) => message.clone(),
            CloudError::EmptyContent => BottleError::EmptyContent.user_message(),
            CloudError::Forbidden => BottleError::Forbidden.user_message(),
            CloudError::UnknownBot(platform) => {
                format!("Cloud bottles are not available on {}.", platform)
            }
            other => {
                tracing::error!("Cloud error: {}", other);
                "The cloud sea is unreachable right now, please try again later.".to_string()
            }
        };
        conv.send(Reply::Text(message)).await
    }
}

/// Run the throw prompt flow: content, optional images, optional title.
///
/// Returns `None` when the user gave no content; every prompt timeout counts
/// as a decline.
async fn collect_draft(
    conv: &mut dyn Conversation,
    inline: Option<IncomingContent>,
) -> anyhow::Result<Option<Draft>> {
    let content = match inline {
        Some(content) => content,
        None => {
            conv.send(Reply::text(
                "Send what you want to put in the bottle: text, images or audio.",
            ))
            .await?;
            match conv.prompt(CONTENT_PROMPT_TIMEOUT).await {
                Some(content) if !content.is_empty() => content,
                _ => {
                    conv.send(Reply::text("No content received, nothing was thrown.")).await?;
                    return Ok(None);
                }
            }
        }
    };

    let mut draft = Draft {
        text: Some(content.text).filter(|t| !t.trim().is_empty()),
        images: content.images,
        audio: content.audio,
        title: None,
    };

    if draft.images.is_empty() && draft.audio.is_empty() {
        conv.send(Reply::text("Add some images? Send them now, or reply \"no\".")).await?;
        if let Some(extra) = conv.prompt(IMAGE_PROMPT_TIMEOUT).await {
            if !extra.is_decline() {
                draft.images.extend(extra.images);
            }
        }
    }

    conv.send(Reply::text("Give the bottle a title? Send it now, or reply \"no\".")).await?;
    if let Some(answer) = conv.prompt(TITLE_PROMPT_TIMEOUT).await {
        if !answer.is_decline() && !answer.text.trim().is_empty() {
            draft.title = Some(answer.text.trim().to_string());
        }
    }

    Ok(Some(draft))
}
