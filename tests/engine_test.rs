//! Engine 集成测试：脚本化的 Agent 与记录回复的 Platform

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex as StdMutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use bee_connect::agent::{
        event_channel, Agent, AgentSession, AgentSessionInfo, Event, EventStream,
        PermissionResponse,
    };
    use bee_connect::core::{AgentError, PlatformError};
    use bee_connect::engine::{
        Engine, EngineSettings, PermissionPolicy, BUSY_NOTICE, EMPTY_RESPONSE, EXITED_NOTICE,
    };
    use bee_connect::platform::{ImageAttachment, Message, Platform, ReplyContext};
    use bee_connect::session::{Role, SessionRegistry};
    use serde_json::json;
    use tokio::sync::{mpsc, Mutex};

    const KEY: &str = "test:chat:user";

    /// 脚本对一次 send / 权限答复的反应
    enum Reply {
        Events(Vec<Event>),
        /// 发出事件后进程退出
        Crash(Vec<Event>),
    }

    type OnSend = Box<dyn Fn(&str) -> Reply + Send + Sync>;
    type OnPermission = Box<dyn Fn(&PermissionResponse) -> Reply + Send + Sync>;

    struct Script {
        on_send: OnSend,
        on_permission: OnPermission,
    }

    impl Script {
        fn new(on_send: impl Fn(&str) -> Reply + Send + Sync + 'static) -> Self {
            Self {
                on_send: Box::new(on_send),
                on_permission: Box::new(|resp| {
                    let content = if resp.is_allow() { "done" } else { "skipped" };
                    Reply::Events(vec![result(content, None)])
                }),
            }
        }
    }

    fn result(content: &str, session_id: Option<&str>) -> Event {
        Event::Result {
            content: content.to_string(),
            session_id: session_id.map(str::to_string),
        }
    }

    struct ScriptedSession {
        tx: Mutex<Option<mpsc::Sender<Event>>>,
        stream: EventStream,
        alive: AtomicBool,
        fail_send: AtomicBool,
        close_delay: Duration,
        script: Arc<Script>,
        responses: Arc<StdMutex<Vec<(String, PermissionResponse)>>>,
    }

    impl ScriptedSession {
        async fn apply(&self, reply: Reply) {
            let (events, crash) = match reply {
                Reply::Events(events) => (events, false),
                Reply::Crash(events) => (events, true),
            };
            let mut tx = self.tx.lock().await;
            if let Some(sender) = tx.as_ref() {
                for event in events {
                    let _ = sender.send(event).await;
                }
            }
            if crash {
                self.alive.store(false, Ordering::SeqCst);
                tx.take();
            }
        }
    }

    #[async_trait]
    impl AgentSession for ScriptedSession {
        async fn send(&self, prompt: &str, _images: &[ImageAttachment]) -> Result<(), AgentError> {
            if self.fail_send.load(Ordering::SeqCst) {
                self.alive.store(false, Ordering::SeqCst);
                return Err(AgentError::NotAlive);
            }
            let reply = (self.script.on_send)(prompt);
            self.apply(reply).await;
            Ok(())
        }

        async fn respond_permission(
            &self,
            request_id: &str,
            response: PermissionResponse,
        ) -> Result<(), AgentError> {
            if !self.alive.load(Ordering::SeqCst) {
                return Err(AgentError::Closed);
            }
            self.responses
                .lock()
                .unwrap()
                .push((request_id.to_string(), response.clone()));
            let reply = (self.script.on_permission)(&response);
            self.apply(reply).await;
            Ok(())
        }

        fn events(&self) -> EventStream {
            self.stream.clone()
        }

        fn current_session_id(&self) -> Option<String> {
            None
        }

        fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        async fn close(&self) -> Result<(), AgentError> {
            tokio::time::sleep(self.close_delay).await;
            self.alive.store(false, Ordering::SeqCst);
            self.tx.lock().await.take();
            Ok(())
        }
    }

    struct ScriptedAgent {
        script: Arc<Script>,
        starts: StdMutex<Vec<Option<String>>>,
        /// 前 N 个会话的 send 返回 NotAlive
        dead_sessions: AtomicUsize,
        fail_start: AtomicBool,
        /// 关闭驱动所需时间
        close_delay: Duration,
        responses: Arc<StdMutex<Vec<(String, PermissionResponse)>>>,
        listing: Vec<AgentSessionInfo>,
    }

    impl ScriptedAgent {
        fn new(script: Script) -> Self {
            Self {
                script: Arc::new(script),
                starts: StdMutex::new(Vec::new()),
                dead_sessions: AtomicUsize::new(0),
                fail_start: AtomicBool::new(false),
                close_delay: Duration::ZERO,
                responses: Arc::new(StdMutex::new(Vec::new())),
                listing: Vec::new(),
            }
        }

        fn start_count(&self) -> usize {
            self.starts.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Agent for ScriptedAgent {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn start_session(
            &self,
            resume_id: Option<&str>,
        ) -> Result<Arc<dyn AgentSession>, AgentError> {
            if self.fail_start.load(Ordering::SeqCst) {
                return Err(AgentError::Spawn {
                    command: "scripted".to_string(),
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
                });
            }
            self.starts.lock().unwrap().push(resume_id.map(str::to_string));
            let fail_send = self
                .dead_sessions
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            let (tx, stream) = event_channel(64);
            Ok(Arc::new(ScriptedSession {
                tx: Mutex::new(Some(tx)),
                stream,
                alive: AtomicBool::new(true),
                fail_send: AtomicBool::new(fail_send),
                close_delay: self.close_delay,
                script: Arc::clone(&self.script),
                responses: Arc::clone(&self.responses),
            }))
        }

        async fn list_sessions(&self) -> Result<Vec<AgentSessionInfo>, AgentError> {
            Ok(self.listing.clone())
        }

        async fn stop(&self) -> Result<(), AgentError> {
            Ok(())
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    enum Sent {
        Reply(String),
        Send(String),
    }

    impl Sent {
        fn text(&self) -> &str {
            match self {
                Sent::Reply(t) | Sent::Send(t) => t,
            }
        }
    }

    struct RecordingPlatform {
        sent: StdMutex<Vec<Sent>>,
        max_len: usize,
    }

    impl RecordingPlatform {
        fn new(max_len: usize) -> Self {
            Self {
                sent: StdMutex::new(Vec::new()),
                max_len,
            }
        }

        fn sent(&self) -> Vec<Sent> {
            self.sent.lock().unwrap().clone()
        }

        fn texts(&self) -> Vec<String> {
            self.sent().iter().map(|s| s.text().to_string()).collect()
        }

        /// 等待某条输出出现
        async fn wait_for(&self, pred: impl Fn(&[Sent]) -> bool) -> Vec<Sent> {
            for _ in 0..200 {
                let sent = self.sent();
                if pred(&sent) {
                    return sent;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("timed out waiting for platform output: {:?}", self.sent());
        }

        async fn wait_for_text(&self, needle: &str) -> Vec<Sent> {
            self.wait_for(|sent| sent.iter().any(|s| s.text().contains(needle)))
                .await
        }
    }

    #[async_trait]
    impl Platform for RecordingPlatform {
        fn name(&self) -> &str {
            "test"
        }

        async fn start(&self, _handler: mpsc::UnboundedSender<Message>) -> Result<(), PlatformError> {
            Ok(())
        }

        async fn reply(&self, _ctx: &ReplyContext, text: &str) -> Result<(), PlatformError> {
            self.sent.lock().unwrap().push(Sent::Reply(text.to_string()));
            Ok(())
        }

        async fn send(&self, _ctx: &ReplyContext, text: &str) -> Result<(), PlatformError> {
            self.sent.lock().unwrap().push(Sent::Send(text.to_string()));
            Ok(())
        }

        async fn stop(&self) -> Result<(), PlatformError> {
            Ok(())
        }

        fn max_message_len(&self) -> usize {
            self.max_len
        }
    }

    struct Harness {
        engine: Arc<Engine>,
        agent: Arc<ScriptedAgent>,
        platform: Arc<RecordingPlatform>,
        sessions: Arc<SessionRegistry>,
    }

    impl Harness {
        fn new(agent: ScriptedAgent) -> Self {
            Self::with_settings(agent, EngineSettings::default(), 4000)
        }

        fn with_settings(agent: ScriptedAgent, settings: EngineSettings, max_len: usize) -> Self {
            let agent = Arc::new(agent);
            let platform = Arc::new(RecordingPlatform::new(max_len));
            let sessions = Arc::new(SessionRegistry::in_memory());
            let engine = Engine::new(
                settings,
                agent.clone(),
                vec![platform.clone() as Arc<dyn Platform>],
                sessions.clone(),
            );
            Self {
                engine,
                agent,
                platform,
                sessions,
            }
        }

        async fn say(&self, text: &str) {
            self.engine
                .handle_message(Message::text("test", KEY, "chat", text))
                .await;
        }

        async fn wait_idle(&self) {
            let session = self.sessions.get_or_create(KEY).await;
            for _ in 0..200 {
                if !session.is_busy() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("turn lock never released");
        }
    }

    #[tokio::test]
    async fn test_text_fragments_become_one_reply() {
        let h = Harness::new(ScriptedAgent::new(Script::new(|_| {
            Reply::Events(vec![
                Event::text("Hel"),
                Event::text("lo"),
                result("", Some("s-1")),
            ])
        })));

        h.say("hi").await;
        let sent = h.platform.wait_for_text("Hello").await;
        assert_eq!(sent, vec![Sent::Reply("Hello".to_string())]);
        h.wait_idle().await;

        let session = h.sessions.get(KEY).await.unwrap();
        assert_eq!(session.agent_session_id().as_deref(), Some("s-1"));
        let history = session.history(10);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[0].content, "hi");
        assert_eq!(history[1].role, Role::Assistant);
        assert_eq!(history[1].content, "Hello");
    }

    #[tokio::test]
    async fn test_second_turn_reuses_driver() {
        let h = Harness::new(ScriptedAgent::new(Script::new(|prompt| {
            Reply::Events(vec![result(&format!("echo {}", prompt), Some("s-1"))])
        })));

        h.say("one").await;
        h.platform.wait_for_text("echo one").await;
        h.wait_idle().await;
        h.say("two").await;
        h.platform.wait_for_text("echo two").await;
        assert_eq!(h.agent.start_count(), 1);
    }

    #[tokio::test]
    async fn test_permission_round_trip() {
        let h = Harness::new(ScriptedAgent::new(Script::new(|_| {
            Reply::Events(vec![Event::PermissionRequest {
                request_id: "r1".to_string(),
                tool: "Bash".to_string(),
                summary: "ls".to_string(),
                input: json!({"command": "ls"}),
            }])
        })));

        h.say("list files").await;
        h.platform.wait_for_text("Permission request").await;

        h.say("allow").await;
        let sent = h.platform.wait_for_text("done").await;
        assert!(sent.iter().any(|s| s.text().contains("Allowed `Bash`")));
        assert_eq!(sent.last(), Some(&Sent::Reply("done".to_string())));

        let responses = h.agent.responses.lock().unwrap().clone();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].0, "r1");
        assert_eq!(responses[0].1, PermissionResponse::allow(json!({"command": "ls"})));
    }

    #[tokio::test]
    async fn test_unrecognized_decision_reprompts() {
        let h = Harness::new(ScriptedAgent::new(Script::new(|_| {
            Reply::Events(vec![Event::PermissionRequest {
                request_id: "r1".to_string(),
                tool: "Edit".to_string(),
                summary: String::new(),
                input: json!({}),
            }])
        })));

        h.say("edit it").await;
        h.platform.wait_for_text("Permission request").await;
        h.say("what?").await;
        h.platform.wait_for_text("waiting for your approval").await;
        assert!(h.agent.responses.lock().unwrap().is_empty());

        h.say("拒绝").await;
        h.platform.wait_for_text("skipped").await;
        assert!(!h.agent.responses.lock().unwrap()[0].1.is_allow());
    }

    #[tokio::test]
    async fn test_allow_all_skips_later_prompts() {
        let h = Harness::new(ScriptedAgent::new(Script::new(|prompt| {
            Reply::Events(vec![Event::PermissionRequest {
                request_id: prompt.to_string(),
                tool: "Bash".to_string(),
                summary: String::new(),
                input: json!({}),
            }])
        })));

        h.say("first").await;
        h.platform.wait_for_text("Permission request").await;
        h.say("allow all").await;
        h.platform.wait_for_text("done").await;
        h.wait_idle().await;

        h.say("second").await;
        h.platform
            .wait_for(|sent| sent.iter().filter(|s| s.text() == "done").count() == 2)
            .await;
        let prompts = h
            .platform
            .texts()
            .iter()
            .filter(|t| t.contains("Permission request"))
            .count();
        assert_eq!(prompts, 1);
        assert_eq!(h.agent.responses.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_permission_times_out_as_deny() {
        let settings = EngineSettings {
            permission: PermissionPolicy::AutoDeny(Duration::from_millis(50)),
            ..EngineSettings::default()
        };
        let h = Harness::with_settings(
            ScriptedAgent::new(Script::new(|_| {
                Reply::Events(vec![Event::PermissionRequest {
                    request_id: "r1".to_string(),
                    tool: "Bash".to_string(),
                    summary: String::new(),
                    input: json!({}),
                }])
            })),
            settings,
            4000,
        );

        h.say("go").await;
        h.platform.wait_for_text("skipped").await;
        assert!(h.platform.texts().iter().any(|t| t.contains("denied")));
        assert!(!h.agent.responses.lock().unwrap()[0].1.is_allow());
    }

    #[tokio::test]
    async fn test_crash_forwards_partial_text_and_restarts_fresh() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let h = Harness::new(ScriptedAgent::new(Script::new(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Reply::Crash(vec![Event::text("Working on it…")])
            } else {
                Reply::Events(vec![result("back", None)])
            }
        })));

        h.say("do it").await;
        h.platform.wait_for_text("Working on it…").await;
        h.wait_idle().await;

        h.say("again").await;
        h.platform.wait_for_text("back").await;
        assert_eq!(h.agent.start_count(), 2);
    }

    #[tokio::test]
    async fn test_crash_without_text_sends_notice() {
        let h = Harness::new(ScriptedAgent::new(Script::new(|_| Reply::Crash(vec![]))));
        h.say("hi").await;
        h.platform.wait_for_text(EXITED_NOTICE).await;
    }

    #[tokio::test]
    async fn test_busy_session_rejects_second_message() {
        let h = Harness::new(ScriptedAgent::new(Script::new(|_| Reply::Events(vec![]))));

        h.say("long task").await;
        let session = h.sessions.get_or_create(KEY).await;
        for _ in 0..100 {
            if session.is_busy() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        h.say("another").await;
        h.platform.wait_for_text(BUSY_NOTICE).await;

        h.say("/stop").await;
        h.platform.wait_for_text("Stopped").await;
        h.wait_idle().await;
        // 被拒绝的消息不进入历史
        let history = session.history(10);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "long task");
    }

    #[tokio::test]
    async fn test_stop_denies_pending_permission() {
        let h = Harness::new(ScriptedAgent::new(Script::new(|_| {
            Reply::Events(vec![Event::PermissionRequest {
                request_id: "r1".to_string(),
                tool: "Bash".to_string(),
                summary: String::new(),
                input: json!({}),
            }])
        })));

        h.say("run").await;
        h.platform.wait_for_text("Permission request").await;
        h.say("/stop").await;
        h.platform.wait_for_text("Stopped").await;
        h.wait_idle().await;
        assert!(!h.platform.texts().iter().any(|t| t.contains(EXITED_NOTICE)));
    }

    #[tokio::test]
    async fn test_restart_once_when_not_alive() {
        let agent = ScriptedAgent::new(Script::new(|_| Reply::Events(vec![result("ok", None)])));
        agent.dead_sessions.store(1, Ordering::SeqCst);
        let h = Harness::new(agent);

        h.say("hi").await;
        h.platform.wait_for_text("ok").await;
        assert_eq!(h.agent.start_count(), 2);
    }

    #[tokio::test]
    async fn test_second_failure_is_surfaced() {
        let agent = ScriptedAgent::new(Script::new(|_| Reply::Events(vec![result("ok", None)])));
        agent.dead_sessions.store(2, Ordering::SeqCst);
        let h = Harness::new(agent);

        h.say("hi").await;
        h.platform.wait_for_text("keeps exiting").await;
        assert_eq!(h.agent.start_count(), 2);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_surfaced_without_retry() {
        let agent = ScriptedAgent::new(Script::new(|_| Reply::Events(vec![])));
        agent.fail_start.store(true, Ordering::SeqCst);
        let h = Harness::new(agent);

        h.say("hi").await;
        h.platform.wait_for_text("Failed to start `scripted`").await;
        h.wait_idle().await;
    }

    #[tokio::test]
    async fn test_empty_result_uses_placeholder() {
        let h = Harness::new(ScriptedAgent::new(Script::new(|_| {
            Reply::Events(vec![result("", None)])
        })));
        h.say("hi").await;
        h.platform.wait_for_text(EMPTY_RESPONSE).await;
    }

    #[tokio::test]
    async fn test_tool_notices_and_quiet_mode() {
        let h = Harness::new(ScriptedAgent::new(Script::new(|_| {
            Reply::Events(vec![
                Event::ToolUse {
                    tool: "Bash".to_string(),
                    summary: "ls".to_string(),
                },
                Event::Thinking {
                    content: "hmm".to_string(),
                },
                result("listed", None),
            ])
        })));

        h.say("first").await;
        let sent = h.platform.wait_for_text("listed").await;
        assert!(sent.contains(&Sent::Send("🔧 Bash: ls".to_string())));
        assert!(sent.contains(&Sent::Send("💭 hmm".to_string())));
        h.wait_idle().await;

        h.say("/quiet").await;
        h.platform.wait_for_text("Quiet mode on").await;
        let before = h.platform.sent().len();
        h.say("second").await;
        h.platform
            .wait_for(|sent| sent.len() > before && sent.last().map(|s| s.text()) == Some("listed"))
            .await;
        assert_eq!(h.platform.sent().len(), before + 1);
    }

    #[tokio::test]
    async fn test_long_reply_is_chunked() {
        let long = format!("{}\n{}", "a".repeat(80), "b".repeat(80));
        let reply = long.clone();
        let h = Harness::with_settings(
            ScriptedAgent::new(Script::new(move |_| Reply::Events(vec![result(&reply, None)]))),
            EngineSettings::default(),
            100,
        );
        h.say("hi").await;
        let sent = h.platform.wait_for(|sent| sent.len() == 2).await;
        assert_eq!(sent[0], Sent::Reply("a".repeat(80)));
        assert_eq!(sent[1], Sent::Send("b".repeat(80)));
    }

    #[tokio::test]
    async fn test_new_clears_agent_session() {
        let h = Harness::new(ScriptedAgent::new(Script::new(|_| {
            Reply::Events(vec![result("ok", Some("s-1"))])
        })));
        h.say("hi").await;
        h.platform.wait_for_text("ok").await;
        h.wait_idle().await;

        h.say("/new").await;
        h.platform.wait_for_text("new session").await;
        let session = h.sessions.get(KEY).await.unwrap();
        assert_eq!(session.agent_session_id(), None);
        assert_eq!(session.history_len(), 2);

        h.say("again").await;
        h.platform
            .wait_for(|sent| sent.iter().filter(|s| s.text() == "ok").count() == 2)
            .await;
        let starts = h.agent.starts.lock().unwrap().clone();
        assert_eq!(starts, vec![None, None]);
    }

    #[tokio::test]
    async fn test_list_and_switch() {
        let mut agent = ScriptedAgent::new(Script::new(|_| Reply::Events(vec![result("ok", None)])));
        let now = chrono::Utc::now();
        agent.listing = vec![
            AgentSessionInfo {
                id: "aaaa1111".to_string(),
                summary: "fix the build".to_string(),
                message_count: 4,
                modified: now,
            },
            AgentSessionInfo {
                id: "bbbb2222".to_string(),
                summary: "write docs".to_string(),
                message_count: 2,
                modified: now - chrono::Duration::hours(1),
            },
        ];
        let h = Harness::new(agent);

        h.say("/list").await;
        let sent = h.platform.wait_for_text("fix the build").await;
        assert!(sent[0].text().contains("2. bbbb2222"));

        h.say("/switch 2").await;
        h.platform.wait_for_text("Switched to bbbb2222").await;
        h.say("hi").await;
        h.platform.wait_for_text("ok").await;
        assert_eq!(
            h.agent.starts.lock().unwrap().clone(),
            vec![Some("bbbb2222".to_string())]
        );

        h.say("/list").await;
        h.platform.wait_for_text("▶ 2.").await;

        h.say("/switch zzz").await;
        h.platform.wait_for_text("No session matches").await;
    }

    #[tokio::test]
    async fn test_help_current_and_unknown_commands() {
        let h = Harness::new(ScriptedAgent::new(Script::new(|_| Reply::Events(vec![]))));
        h.say("/help").await;
        h.platform.wait_for_text("/switch").await;
        h.say("/current").await;
        h.platform.wait_for_text("not started").await;
        h.say("/bogus").await;
        h.platform.wait_for_text("Unknown command /bogus").await;
        h.say("/history").await;
        h.platform.wait_for_text("No history yet").await;
        assert_eq!(h.agent.start_count(), 0);
    }

    #[tokio::test]
    async fn test_allowed_tool_skips_prompt() {
        let h = Harness::new(ScriptedAgent::new(Script::new(|_| {
            Reply::Events(vec![Event::PermissionRequest {
                request_id: "r1".to_string(),
                tool: "Read".to_string(),
                summary: String::new(),
                input: json!({"file_path": "a.rs"}),
            }])
        })));
        h.say("/allow Read").await;
        h.platform.wait_for_text("will be allowed").await;
        h.say("read it").await;
        h.platform.wait_for_text("done").await;
        assert!(!h.platform.texts().iter().any(|t| t.contains("Permission request")));
    }

    #[tokio::test]
    async fn test_turn_summary_counts_tool_uses() {
        let h = Harness::new(ScriptedAgent::new(Script::new(|_| {
            let mut events: Vec<Event> = (0..3)
                .map(|i| Event::ToolUse {
                    tool: "Bash".to_string(),
                    summary: format!("step {}", i),
                })
                .collect();
            events.push(result("finished", Some("s-7")));
            Reply::Events(events)
        })));
        let mut turns = h.engine.subscribe_turns();

        h.say("work").await;
        let summary = tokio::time::timeout(Duration::from_secs(2), turns.recv())
            .await
            .expect("no turn summary")
            .unwrap();
        assert_eq!(summary.session_key, KEY);
        assert_eq!(summary.tool_count, 3);
        assert_eq!(summary.response, "finished");
        assert_eq!(summary.session_id.as_deref(), Some("s-7"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_messages_run_one_turn() {
        const MESSAGES: usize = 8;
        let h = Harness::new(ScriptedAgent::new(Script::new(|_| Reply::Events(vec![]))));
        let barrier = Arc::new(tokio::sync::Barrier::new(MESSAGES));
        let handles: Vec<_> = (0..MESSAGES)
            .map(|i| {
                let engine = Arc::clone(&h.engine);
                let barrier = Arc::clone(&barrier);
                tokio::spawn(async move {
                    barrier.wait().await;
                    engine
                        .handle_message(Message::text("test", KEY, "chat", format!("msg {}", i)))
                        .await;
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        let busy = h.platform.texts().iter().filter(|t| *t == BUSY_NOTICE).count();
        assert_eq!(busy, MESSAGES - 1);
        h.platform
            .wait_for(|_| h.agent.start_count() == 1)
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.agent.start_count(), 1);
        assert_eq!(h.sessions.get(KEY).await.unwrap().history_len(), 1);

        h.say("/stop").await;
        h.platform.wait_for_text("Stopped").await;
        h.wait_idle().await;
    }

    #[tokio::test]
    async fn test_whitespace_partial_falls_back_to_error() {
        let h = Harness::new(ScriptedAgent::new(Script::new(|_| {
            Reply::Events(vec![Event::text("\n  "), Event::error("rate limited")])
        })));
        h.say("hi").await;
        let sent = h.platform.wait_for_text("rate limited").await;
        assert_eq!(sent, vec![Sent::Reply("❌ rate limited".to_string())]);
    }

    #[tokio::test]
    async fn test_stop_returns_before_driver_closes() {
        let mut agent = ScriptedAgent::new(Script::new(|_| Reply::Events(vec![])));
        agent.close_delay = Duration::from_secs(3);
        let h = Harness::new(agent);
        h.say("long task").await;
        h.platform.wait_for(|_| h.agent.start_count() == 1).await;

        let started = std::time::Instant::now();
        h.say("/stop").await;
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(h.platform.texts().last().map(String::as_str), Some("⏹ Stopped."));
        // 关闭仍在后台进行，其他对话与命令不受影响
        h.say("/help").await;
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    /// 真实的按轮驱动：第一次启动的进程没有结果就退出，之后的进程正常回复
    #[cfg(unix)]
    mod per_turn {
        use std::path::PathBuf;

        use bee_connect::agent::per_turn::{TurnProtocol, TurnSession};
        use bee_connect::agent::process::{parse_line, CommandSpec, Decoded, LineDecoder};
        use bee_connect::agent::AgentContext;
        use serde::Deserialize;
        use tokio_util::sync::CancellationToken;

        use super::*;

        struct ShellProtocol {
            script: &'static str,
        }

        #[derive(Deserialize)]
        #[serde(tag = "type", rename_all = "snake_case")]
        enum Line {
            Text { text: String },
            Done,
        }

        struct ShellDecoder;

        impl LineDecoder for ShellDecoder {
            fn decode(&mut self, line: &str) -> Vec<Decoded> {
                match parse_line::<Line>("shell", line) {
                    Some(Line::Text { text }) => vec![Decoded::Event(Event::text(text))],
                    Some(Line::Done) => vec![Decoded::Event(result("", None))],
                    None => Vec::new(),
                }
            }
        }

        impl TurnProtocol for ShellProtocol {
            type Decoder = ShellDecoder;

            fn name(&self) -> &'static str {
                "shell"
            }

            fn command(&self, _prompt: &str, _resume_id: Option<&str>, _image_paths: &[PathBuf]) -> CommandSpec {
                CommandSpec::new("sh", ".").arg("-c").arg(self.script)
            }

            fn decoder(&self) -> ShellDecoder {
                ShellDecoder
            }
        }

        struct ShellAgent {
            starts: AtomicUsize,
            ctx: AgentContext,
        }

        #[async_trait]
        impl Agent for ShellAgent {
            fn name(&self) -> &str {
                "shell"
            }

            async fn start_session(
                &self,
                resume_id: Option<&str>,
            ) -> Result<Arc<dyn AgentSession>, AgentError> {
                let script = if self.starts.fetch_add(1, Ordering::SeqCst) == 0 {
                    "echo 'model overloaded' >&2; exit 1"
                } else {
                    r#"printf '{"type":"text","text":"recovered"}\n{"type":"done"}\n'"#
                };
                Ok(Arc::new(TurnSession::new(
                    Arc::new(ShellProtocol { script }),
                    resume_id,
                    &self.ctx,
                )))
            }

            async fn list_sessions(&self) -> Result<Vec<AgentSessionInfo>, AgentError> {
                Ok(Vec::new())
            }

            async fn stop(&self) -> Result<(), AgentError> {
                Ok(())
            }
        }

        #[tokio::test]
        async fn test_failed_turn_process_is_replaced() {
            let agent = Arc::new(ShellAgent {
                starts: AtomicUsize::new(0),
                ctx: AgentContext::new(".", 16, CancellationToken::new()),
            });
            let platform = Arc::new(RecordingPlatform::new(4000));
            let sessions = Arc::new(SessionRegistry::in_memory());
            let engine = Engine::new(
                EngineSettings::default(),
                agent.clone(),
                vec![platform.clone() as Arc<dyn Platform>],
                sessions.clone(),
            );

            engine
                .handle_message(Message::text("test", KEY, "chat", "hi"))
                .await;
            platform.wait_for_text("model overloaded").await;
            let session = sessions.get_or_create(KEY).await;
            for _ in 0..200 {
                if !session.is_busy() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }

            engine
                .handle_message(Message::text("test", KEY, "chat", "again"))
                .await;
            platform.wait_for_text("recovered").await;
            assert_eq!(agent.starts.load(Ordering::SeqCst), 2);
        }
    }
}
