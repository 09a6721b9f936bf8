use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use driftbottle::activity::ActivityLog;
use driftbottle::bottles::{BottleRepository, BottleStore, Draft, Requester};
use driftbottle::commands::{
    parse_command, Command, CommandHandler, Conversation, HandlerSettings, IncomingContent, PlainRenderer, Reply,
    Session,
};
use driftbottle::config::CoolingConfig;
use driftbottle::cooling::CoolingGate;
use driftbottle::db::{self, KvStore, SqliteKvStore};
use driftbottle::media::{MediaError, MediaKind, MediaStore};
use driftbottle::moderation::ContentModerator;
use tempfile::TempDir;

/// A chat whose answers are queued up front. An exhausted queue behaves like
/// a prompt timing out.
#[derive(Default)]
struct ScriptedChat {
    answers: VecDeque<Option<IncomingContent>>,
    prompts: Vec<Duration>,
    replies: Vec<Reply>,
}

impl ScriptedChat {
    fn answering(answers: &[Option<&str>]) -> Self {
        Self {
            answers: answers.iter().map(|a| a.map(IncomingContent::parse)).collect(),
            ..Self::default()
        }
    }

    fn texts(&self) -> Vec<String> {
        self.replies
            .iter()
            .filter_map(|reply| match reply {
                Reply::Text(text) => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    fn last_text(&self) -> String {
        self.texts().pop().unwrap_or_default()
    }
}

#[async_trait]
impl Conversation for ScriptedChat {
    async fn prompt(&mut self, timeout: Duration) -> Option<IncomingContent> {
        self.prompts.push(timeout);
        self.answers.pop_front().flatten()
    }

    async fn send(&mut self, reply: Reply) -> anyhow::Result<()> {
        self.replies.push(reply);
        Ok(())
    }
}

struct EchoMedia;

#[async_trait]
impl MediaStore for EchoMedia {
    async fn store(&self, remote_url: &str, kind: MediaKind, _hint: Option<&str>) -> Result<String, MediaError> {
        let name = remote_url.rsplit('/').next().unwrap_or_default();
        Ok(format!("file:///media/{}/{}", kind.subdir(), name))
    }
}

struct TestBot {
    handler: CommandHandler,
    store: Arc<BottleStore>,
    _temp_dir: TempDir,
}

impl TestBot {
    async fn run(&self, session: &Session, chat: &mut ScriptedChat, line: &str) {
        let command = parse_command(&IncomingContent::parse(line)).unwrap();
        self.handler.handle(session, chat, command).await.unwrap();
    }
}

fn setup_with(cooling: CoolingConfig, author_can_delete_comments: bool) -> TestBot {
    let temp_dir = TempDir::new().unwrap();
    let pool = db::create_pool(&temp_dir.path().join("test.db")).expect("Failed to create test database");
    db::run_migrations(&pool).expect("Failed to run migrations");
    let kv: Arc<dyn KvStore> = Arc::new(SqliteKvStore::new(pool));

    let store = Arc::new(BottleStore::new(
        BottleRepository::new(kv.clone(), "bottles", "history"),
        Arc::new(EchoMedia),
        Arc::new(ContentModerator::disabled()),
        Arc::new(ActivityLog::new(kv, "log", 50)),
        0,
    ));
    let handler = CommandHandler::new(
        store.clone(),
        Arc::new(CoolingGate::new(&cooling)),
        None,
        Arc::new(PlainRenderer),
        HandlerSettings {
            bot_id: "1020".to_string(),
            style: 0,
            page_size: 10,
            author_can_delete_comments,
            onebot_avatars: false,
        },
    );

    TestBot {
        handler,
        store,
        _temp_dir: temp_dir,
    }
}

fn setup() -> TestBot {
    let no_cooldown = CoolingConfig {
        throw_ms: 0,
        retrieve_ms: 0,
        comment_ms: 0,
    };
    setup_with(no_cooldown, false)
}

fn session(user: Requester) -> Session {
    Session {
        user,
        platform: "qq".to_string(),
        self_id: "1020".to_string(),
        bot_avatar: None,
    }
}

#[tokio::test]
async fn test_throw_walks_through_every_prompt() {
    let bot = setup();
    let alice = session(Requester::new("alice"));
    let mut chat = ScriptedChat::answering(&[Some("hello sea"), Some("no"), Some("Greetings")]);

    bot.run(&alice, &mut chat, "throw").await;

    assert_eq!(
        chat.prompts,
        vec![Duration::from_secs(20), Duration::from_secs(10), Duration::from_secs(20)]
    );
    assert_eq!(chat.last_text(), "Your text-only bottle #1 is out to sea.");

    let bottle = &bot.store.authored_by("alice").await[0];
    assert_eq!(bottle.content.text.as_deref(), Some("hello sea"));
    assert_eq!(bottle.content.title.as_deref(), Some("Greetings"));
}

#[tokio::test]
async fn test_throw_picks_up_images_from_the_image_prompt() {
    let bot = setup();
    let alice = session(Requester::new("alice"));
    let mut chat = ScriptedChat::answering(&[Some("[img:https://cdn/a.png]"), None]);

    bot.run(&alice, &mut chat, "throw look at this").await;

    // Inline content skips the content prompt; the title prompt timed out
    assert_eq!(chat.prompts.len(), 2);
    assert_eq!(chat.last_text(), "Your image-and-text bottle #1 is out to sea.");
    let bottle = &bot.store.authored_by("alice").await[0];
    assert_eq!(bottle.content.title, None);
    assert_eq!(bottle.content.images.as_deref(), Some(&["file:///media/image/a.png".to_string()][..]));
}

#[tokio::test]
async fn test_inline_media_skips_the_image_prompt() {
    let bot = setup();
    let alice = session(Requester::new("alice"));
    let mut chat = ScriptedChat::answering(&[Some("no")]);

    bot.run(&alice, &mut chat, "throw [audio:https://cdn/v.silk]").await;

    assert_eq!(chat.prompts, vec![Duration::from_secs(20)]);
    assert_eq!(chat.last_text(), "Your audio bottle #1 is out to sea.");
}

#[tokio::test]
async fn test_throw_without_content_does_nothing() {
    let bot = setup();
    let alice = session(Requester::new("alice"));
    let mut chat = ScriptedChat::default();

    bot.run(&alice, &mut chat, "throw").await;

    assert_eq!(chat.last_text(), "No content received, nothing was thrown.");
    assert_eq!(bot.store.last_id().await, 0);
}

#[tokio::test]
async fn test_cooldown_blocks_repeated_throws() {
    let bot = setup_with(CoolingConfig::default(), false);
    let alice = session(Requester::new("alice"));

    let mut chat = ScriptedChat::answering(&[None]);
    bot.run(&alice, &mut chat, "throw first").await;
    assert_eq!(chat.last_text(), "Your text-only bottle #1 is out to sea.");

    let mut chat = ScriptedChat::default();
    bot.run(&alice, &mut chat, "throw second").await;
    assert!(chat.prompts.is_empty());
    assert!(
        chat.last_text().starts_with("Cooling down, try again in"),
        "unexpected reply: {}",
        chat.last_text()
    );

    // Other users and other actions have their own clocks
    let mut chat = ScriptedChat::answering(&[None]);
    bot.run(&session(Requester::new("bob")), &mut chat, "throw mine").await;
    assert_eq!(chat.last_text(), "Your text-only bottle #2 is out to sea.");
    let mut chat = ScriptedChat::default();
    bot.run(&alice, &mut chat, "retrieve").await;
    assert!(!chat.texts()[0].starts_with("Cooling down"));
}

#[tokio::test]
async fn test_retrieve_renders_the_bottle() {
    let bot = setup();
    bot.store
        .create(&Requester::new("alice").with_name("Alice"), Draft::text("hello"))
        .await
        .unwrap();
    let bob = session(Requester::new("bob"));

    let mut chat = ScriptedChat::default();
    bot.run(&bob, &mut chat, "retrieve 1").await;
    assert_eq!(
        chat.last_text(),
        "You have not retrieved bottle #1 yet, so you cannot open it."
    );

    let mut chat = ScriptedChat::default();
    bot.run(&bob, &mut chat, "retrieve").await;
    let texts = chat.texts();
    assert!(texts[0].starts_with("Bottle #1 (text-only) from Alice"));
    assert!(texts[0].contains("hello"));
    assert_eq!(texts[1], "Reply with \"comment 1 <content>\" to leave a comment.");
}

#[tokio::test]
async fn test_audio_bottles_play_back() {
    let bot = setup();
    bot.store
        .create(
            &Requester::new("alice"),
            Draft::default()
                .with_audio(vec!["https://cdn/v.silk".into()])
                .with_title("listen"),
        )
        .await
        .unwrap();

    let mut chat = ScriptedChat::default();
    bot.run(&session(Requester::new("bob")), &mut chat, "retrieve").await;
    assert_eq!(
        chat.replies,
        vec![
            Reply::text("Bottle #1: listen"),
            Reply::Audio("file:///media/audio/v.silk".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_comment_and_delete_flow() {
    let bot = setup();
    bot.store.create(&Requester::new("alice"), Draft::text("hello")).await.unwrap();
    let bob = session(Requester::new("bob"));
    let admin = session(Requester::admin("root"));

    let mut chat = ScriptedChat::default();
    bot.run(&bob, &mut chat, "retrieve").await;
    bot.run(&bob, &mut chat, "comment 1 nice bottle").await;
    assert_eq!(chat.last_text(), "Comment #1 added to bottle #1.");

    // Non-admins are refused before any prompt
    let mut chat = ScriptedChat::answering(&[Some("1")]);
    bot.run(&bob, &mut chat, "delete-comments 1").await;
    assert!(chat.prompts.is_empty());
    assert_eq!(chat.last_text(), "Only administrators can do that.");

    let mut chat = ScriptedChat::answering(&[Some("1，9")]);
    bot.run(&admin, &mut chat, "delete-comments 1").await;
    assert_eq!(chat.prompts, vec![Duration::from_secs(20)]);
    assert_eq!(chat.last_text(), "Comment #1 removed.");

    let mut chat = ScriptedChat::answering(&[Some("1")]);
    bot.run(&admin, &mut chat, "delete-comments 1").await;
    assert_eq!(chat.last_text(), "Comment #1 was already removed.");

    let mut chat = ScriptedChat::answering(&[Some("4")]);
    bot.run(&admin, &mut chat, "delete-comments 1").await;
    assert_eq!(chat.last_text(), "None of those comments exist.");

    let mut chat = ScriptedChat::default();
    bot.run(&admin, &mut chat, "delete-comments 1").await;
    assert_eq!(chat.last_text(), "No answer, nothing was removed.");
}

#[tokio::test]
async fn test_authors_may_delete_when_allowed() {
    let bot = setup_with(
        CoolingConfig {
            throw_ms: 0,
            retrieve_ms: 0,
            comment_ms: 0,
        },
        true,
    );
    let alice = session(Requester::new("alice"));
    let bob = session(Requester::new("bob"));
    bot.store.create(&alice.user, Draft::text("hello")).await.unwrap();

    let mut chat = ScriptedChat::default();
    bot.run(&bob, &mut chat, "retrieve").await;
    bot.run(&bob, &mut chat, "comment 1 hi").await;

    let mut chat = ScriptedChat::answering(&[Some("1")]);
    bot.run(&bob, &mut chat, "delete-comments 1").await;
    assert_eq!(chat.last_text(), "Only administrators can do that.");

    let mut chat = ScriptedChat::answering(&[Some("1")]);
    bot.run(&alice, &mut chat, "delete-comments 1").await;
    assert_eq!(chat.last_text(), "Comment #1 removed.");
}

#[tokio::test]
async fn test_hide_and_unhide_replies() {
    let bot = setup();
    bot.store.create(&Requester::new("alice"), Draft::text("hello")).await.unwrap();
    let admin = session(Requester::admin("root"));

    let mut chat = ScriptedChat::default();
    bot.run(&admin, &mut chat, "hide 1").await;
    assert_eq!(chat.last_text(), "Bottle #1 is now hidden.");
    bot.run(&admin, &mut chat, "hide 1").await;
    assert_eq!(chat.last_text(), "Bottle #1 is already hidden.");
    bot.run(&admin, &mut chat, "unhide 1").await;
    assert_eq!(chat.last_text(), "Bottle #1 is now visible again.");
    bot.run(&session(Requester::new("alice")), &mut chat, "hide 1").await;
    assert_eq!(chat.last_text(), "Only administrators can do that.");
}

#[tokio::test]
async fn test_activity_marks_new_entries_once() {
    let bot = setup();
    let alice = session(Requester::new("alice"));

    let mut chat = ScriptedChat::default();
    bot.run(&alice, &mut chat, "log").await;
    assert_eq!(chat.last_text(), "Your activity log is empty.");

    bot.store.create(&alice.user, Draft::text("hello")).await.unwrap();
    bot.run(&alice, &mut chat, "log").await;
    let texts = chat.texts();
    assert_eq!(texts[texts.len() - 2], "You have 1 new event(s).");
    let first = chat.last_text();
    assert!(first.starts_with("[new] "));
    assert!(first.ends_with("You threw bottle #1 (text-only)"));

    let before = chat.texts().len();
    bot.run(&alice, &mut chat, "activity").await;
    assert_eq!(chat.texts().len(), before + 1);
    assert!(!chat.last_text().starts_with("[new] "));
}

#[tokio::test]
async fn test_history_lists_newest_first() {
    let bot = setup();
    let admin = session(Requester::admin("root"));
    bot.store.create(&Requester::new("alice"), Draft::text("a")).await.unwrap();
    bot.store
        .create(&Requester::new("alice"), Draft::default().with_images(vec!["https://cdn/p.png".into()]))
        .await
        .unwrap();

    let mut chat = ScriptedChat::default();
    bot.run(&admin, &mut chat, "history").await;
    assert_eq!(chat.last_text(), "You have not retrieved any bottles yet.");

    bot.run(&admin, &mut chat, "retrieve 1").await;
    bot.run(&admin, &mut chat, "retrieve 2").await;
    bot.run(&admin, &mut chat, "history").await;
    assert_eq!(chat.last_text(), "#2 image-only\n#1 text-only");
}

#[tokio::test]
async fn test_stats_and_cloud_without_bridge() {
    let bot = setup();
    bot.store.create(&Requester::new("alice"), Draft::text("a")).await.unwrap();
    let alice = session(Requester::new("alice"));

    let mut chat = ScriptedChat::default();
    bot.handler.handle(&alice, &mut chat, Command::Stats).await.unwrap();
    assert!(chat.last_text().starts_with("Bottles in the sea: 1"));

    bot.run(&alice, &mut chat, "cloud-retrieve").await;
    assert_eq!(chat.last_text(), "Cloud bottles are disabled.");
}
