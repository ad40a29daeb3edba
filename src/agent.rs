use futures::{Stream, StreamExt};
use tokio::sync::mpsc;

use crate::{
    chat::{LlmClient, Msg, Usage},
    checkpoint::Checkpoints,
    data::{Storage, UsageSample},
};

/// Returned verbatim whenever generation fails. The user's message stays in
/// the checkpoint even then; no rollback.
pub const APOLOGY: &str = "I'm sorry, I ran into a problem generating a \
    response. Please try again in a moment.";

/// Best-effort accounting side channel: a bounded queue drained by one
/// background task. A full queue or a failed write drops the sample; the
/// response path never blocks on it.
#[derive(Clone)]
pub struct UsageSink {
    tx: mpsc::Sender<UsageSample>,
}

impl UsageSink {
    pub fn spawn(storage: Storage, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<UsageSample>(capacity);
        tokio::spawn(async move {
            while let Some(sample) = rx.recv().await {
                if let Err(error) = storage.record_usage(&sample).await {
                    tracing::error!(
                        ?error,
                        user_id = sample.user_id,
                        "Failed to record usage sample."
                    );
                }
            }
        });
        Self { tx }
    }

    /// A sink whose drain side is gone; every push is dropped. Lets tests
    /// exercise the failure-isolation contract.
    #[cfg(test)]
    pub fn closed() -> Self {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        Self { tx }
    }

    pub fn push(&self, sample: UsageSample) {
        if let Err(error) = self.tx.try_send(sample) {
            tracing::warn!(%error, "Dropping usage sample.");
        }
    }
}

/// Single-step conversation orchestrator: one LLM invocation per call,
/// checkpointed history, usage reported through the sink.
#[derive(Clone)]
pub struct Agent {
    llm: LlmClient,
    checkpoints: Checkpoints,
    usage: UsageSink,
    system_prompt: String,
}

impl Agent {
    pub fn new(
        llm: LlmClient,
        checkpoints: Checkpoints,
        usage: UsageSink,
        system_prompt: String,
    ) -> Self {
        Self {
            llm,
            checkpoints,
            usage,
            system_prompt,
        }
    }

    #[tracing::instrument(skip(self, text))]
    pub async fn invoke(
        &self,
        user_id: i64,
        thread_id: &str,
        main_call_id: &str,
        text: &str,
    ) -> anyhow::Result<String> {
        self.checkpoints.append(thread_id, Msg::user(text)).await?;
        let messages = self.context(thread_id).await?;
        match self.llm.complete(messages).await {
            Err(error) => {
                tracing::error!(?error, thread_id, "LLM invocation failed.");
                Ok(APOLOGY.to_string())
            }
            Ok(completion) => {
                // The reply takes precedence over checkpointing it.
                if let Err(error) = self
                    .checkpoints
                    .append(thread_id, Msg::assistant(&completion.content))
                    .await
                {
                    tracing::error!(
                        ?error,
                        thread_id,
                        "Failed to checkpoint assistant reply."
                    );
                }
                self.usage.push(self.sample(
                    user_id,
                    main_call_id,
                    completion.model,
                    completion.usage,
                ));
                Ok(completion.content)
            }
        }
    }

    /// Lazy fragment sequence; finite; not restartable. Production stops
    /// when the caller drops the stream.
    pub fn stream(
        &self,
        user_id: i64,
        thread_id: String,
        main_call_id: String,
        text: String,
    ) -> impl Stream<Item = String> + Send + 'static {
        let agent = self.clone();
        async_stream::stream! {
            if let Err(error) =
                agent.checkpoints.append(&thread_id, Msg::user(&text)).await
            {
                tracing::error!(
                    ?error,
                    thread_id,
                    "Failed to checkpoint user message."
                );
                yield APOLOGY.to_string();
                return;
            }
            let messages = match agent.context(&thread_id).await {
                Err(error) => {
                    tracing::error!(
                        ?error,
                        thread_id,
                        "Failed to load conversation context."
                    );
                    yield APOLOGY.to_string();
                    return;
                }
                Ok(messages) => messages,
            };
            let events = match agent.llm.complete_stream(messages).await {
                Err(error) => {
                    tracing::error!(
                        ?error,
                        thread_id,
                        "LLM stream failed to open."
                    );
                    yield APOLOGY.to_string();
                    return;
                }
                Ok(events) => events,
            };
            futures::pin_mut!(events);
            let mut reply = String::new();
            let mut model = None;
            let mut usage = None;
            while let Some(event) = events.next().await {
                match event {
                    Err(error) => {
                        tracing::error!(
                            ?error,
                            thread_id,
                            "LLM stream failed mid-flight."
                        );
                        break;
                    }
                    Ok(event) => {
                        if event.model.is_some() {
                            model = event.model;
                        }
                        if event.usage.is_some() {
                            usage = event.usage;
                        }
                        if let Some(delta) = event.delta {
                            reply.push_str(&delta);
                            yield delta;
                        }
                    }
                }
            }
            if !reply.is_empty() {
                if let Err(error) = agent
                    .checkpoints
                    .append(&thread_id, Msg::assistant(&reply))
                    .await
                {
                    tracing::error!(
                        ?error,
                        thread_id,
                        "Failed to checkpoint assistant reply."
                    );
                }
            }
            if !reply.is_empty() || usage.is_some() {
                agent.usage.push(agent.sample(
                    user_id,
                    &main_call_id,
                    model,
                    usage,
                ));
            }
        }
    }

    async fn context(&self, thread_id: &str) -> anyhow::Result<Vec<Msg>> {
        let history = self.checkpoints.load(thread_id).await?;
        let mut messages = Vec::with_capacity(history.len() + 1);
        messages.push(Msg::system(&self.system_prompt));
        messages.extend(history);
        Ok(messages)
    }

    /// Token counts default to zero when the upstream omits usage metadata;
    /// the row still marks the call for query counting.
    fn sample(
        &self,
        user_id: i64,
        main_call_id: &str,
        model: Option<String>,
        usage: Option<Usage>,
    ) -> UsageSample {
        let usage = usage.unwrap_or(Usage {
            prompt_tokens: 0,
            completion_tokens: 0,
            total_tokens: 0,
        });
        UsageSample {
            user_id,
            main_call_id: main_call_id.to_string(),
            node_call_id: cuid2::create_id(),
            model: model.or_else(|| Some(self.llm.model().to_string())),
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
        }
    }
}
