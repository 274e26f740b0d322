// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use dodo_config::AgentConfig;
use dodo_model::{
    ClientError, Completion, CompletionRequest, LlmClient, Message, StreamEvent,
    ToolCallAssembler, ToolCallRequest, Usage,
};
use dodo_tools::events::ToolEvent;
use dodo_tools::{ToolCall, ToolCategory, ToolOutput, ToolRegistry};

use crate::budget::{budget_for_model, BudgetConfig, HeuristicTokenizer, Tokenizer};
use crate::compress::prepare_messages;
use crate::error::{AgentError, ExecContext, Operation, SoftCapKind};
use crate::hooks::HookBus;
use crate::retry::{retry_llm, retry_tool, RetryPolicy};
use crate::state::{
    search_replace_failure_key, AgentState, BUILD_FAILURE_KEY,
};

use futures::StreamExt;

/// The core agent: owns the run state and drives the Reason-Act loop.
pub struct Agent {
    state: AgentState,
    tools: Arc<ToolRegistry>,
    client: Arc<dyn LlmClient>,
    tokenizer: Arc<dyn Tokenizer>,
    config: AgentConfig,
    llm_retry: RetryPolicy,
    tool_retry: RetryPolicy,
    /// Receives `ToolEvent`s emitted by stateful tools (the `plan` tool).
    /// The paired sender lives inside the registry's tool instances.
    tool_events: mpsc::Receiver<ToolEvent>,
}

impl Agent {
    /// Construct an agent.
    ///
    /// `tool_events` must be the receiving end of the channel whose sender
    /// was given to the `plan` tool, so plan updates are drained by the
    /// loop.  The token budget comes from config overrides when present,
    /// otherwise from the per-model preset.
    pub fn new(
        client: Arc<dyn LlmClient>,
        tools: Arc<ToolRegistry>,
        config: AgentConfig,
        tool_events: mpsc::Receiver<ToolEvent>,
    ) -> Result<Self, AgentError> {
        let preset = budget_for_model(client.model());
        let budget = BudgetConfig::new(
            config.soft_limit.unwrap_or(preset.soft_limit),
            config.hard_limit.unwrap_or(preset.hard_limit),
            config.reserve.unwrap_or(preset.reserve),
            config.max_compression_passes.unwrap_or(preset.max_passes),
        )?;
        let state = AgentState::new(client.model().to_string(), config.max_steps, budget);
        Ok(Self {
            state,
            tools,
            client,
            tokenizer: Arc::new(HeuristicTokenizer),
            config,
            llm_retry: RetryPolicy::llm_default(),
            tool_retry: RetryPolicy::tool_default(),
            tool_events,
        })
    }

    pub fn state(&self) -> &AgentState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut AgentState {
        &mut self.state
    }

    pub fn client(&self) -> &Arc<dyn LlmClient> {
        &self.client
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    /// Hot-swap the LLM client between runs; the transcript is preserved.
    pub fn set_client(&mut self, client: Arc<dyn LlmClient>) {
        self.state.model = client.model().to_string();
        self.client = client;
    }

    /// Inject one message between runs (e.g. a previous-session summary)
    /// without invoking the loop.
    pub fn append_message(&mut self, msg: Message) {
        self.state.push(msg);
    }

    /// Drive the Reason-Act loop until the model answers without tools,
    /// `respond` is called, the step ceiling is reached (not an error), a
    /// soft cap fires, or the run is cancelled.
    pub async fn run(
        &mut self,
        cancel: &CancellationToken,
        hooks: &HookBus,
    ) -> Result<(), AgentError> {
        while self.state.step < self.state.max_steps && !self.state.done {
            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            if let Some(kind) = self.soft_cap() {
                hooks.on_soft_cap(&kind.guidance());
                return Err(AgentError::SoftCap { kind });
            }

            self.state.phase = self.state.detect_phase(&self.tools);
            let step = self.state.step;
            let phase = self.state.phase;
            hooks.on_step_start(step, phase);

            let messages = prepare_messages(
                &self.state.transcript,
                self.config.compression,
                &self.state.budget,
                self.tokenizer.as_ref(),
                &self.state.model,
                Some(&self.client),
                hooks,
            )
            .await
            .map_err(|e| {
                // Budget failures come out of the compression stage of the
                // prepare pipeline; everything else is preparation proper.
                let operation = if e.is_budget() {
                    Operation::Compression
                } else {
                    Operation::MessagePreparation
                };
                e.with_context(ExecContext::new(step, phase, operation))
            })?;

            let schemas: Vec<dodo_model::ToolSchema> = self
                .tools
                .schemas()
                .into_iter()
                .map(|s| dodo_model::ToolSchema {
                    name: s.name,
                    description: s.description,
                    parameters: s.parameters,
                })
                .collect();
            hooks.before_llm(step, messages.len(), schemas.len());

            let completion = self
                .call_llm(messages, schemas, cancel, hooks)
                .await
                .map_err(|e| e.with_context(ExecContext::new(step, phase, Operation::LlmCall)))?;

            self.state.usage.add(completion.usage);
            self.state.push(Message::assistant_with_calls(
                completion.content.clone(),
                completion.tool_calls.clone(),
            ));
            hooks.after_llm(
                step,
                &completion.content,
                completion.tool_calls.len(),
                &self.state.usage,
            );
            hooks.on_history_changed(self.state.transcript.len());

            if completion.tool_calls.is_empty() {
                self.state.done = true;
                hooks.on_done(&completion.content);
                self.state.step += 1;
                return Ok(());
            }

            // Calls the provider reported as truncated are answered with a
            // synthetic error instead of being executed or re-requested.
            let mut executable: Vec<ToolCallRequest> = Vec::new();
            for call in completion.tool_calls {
                if let Some(err) = &call.error {
                    let msg = format!(
                        "ERROR: provider truncated this tool call ({err}); \
                         re-issue it with complete arguments"
                    );
                    hooks.on_tool_result(&call.id, &call.name, &msg, true);
                    self.state.push(Message::tool_result(&call.id, msg));
                } else {
                    executable.push(call);
                }
            }

            // Planning enforcement: edit-category calls are refused until a
            // mini-plan exists.
            let mut allowed: Vec<ToolCallRequest> = Vec::new();
            for call in executable {
                let is_edit = matches!(self.tools.category(&call.name), Some(ToolCategory::Edit));
                if self.config.planning_required && self.state.plan.is_none() && is_edit {
                    self.state.edit_blocked = true;
                    hooks.on_tool_call(&call);
                    let msg = format!(
                        "ERROR: Planning required before edit operations. Create a \
                         plan with the `plan` tool, then retry {}.",
                        call.name
                    );
                    hooks.on_tool_result(&call.id, &call.name, &msg, true);
                    self.state.push(Message::tool_result(&call.id, msg));
                } else {
                    allowed.push(call);
                }
            }

            // Execute surviving calls concurrently, appending results in
            // the order the calls appeared in the assistant message.
            let (outputs, was_cancelled) = self.dispatch(&allowed, cancel, hooks).await;

            let mut respond_summary: Option<String> = None;
            for (call, output) in allowed.iter().zip(outputs.into_iter()) {
                self.state.tool_calls_total += 1;
                let content = if output.is_error {
                    format!("ERROR: {}", output.content)
                } else {
                    output.content.clone()
                };
                hooks.on_tool_result(&call.id, &call.name, &content, output.is_error);
                self.state.push(Message::tool_result(&call.id, content));
                if output.is_error {
                    self.note_failure(call);
                } else if call.name == "respond" {
                    respond_summary = Some(output.content);
                }
            }
            hooks.on_history_changed(self.state.transcript.len());
            self.drain_tool_events(hooks);

            if was_cancelled {
                // Every dispatched call already has a (possibly synthetic)
                // tool message, so the transcript holds no dangling calls.
                return Err(AgentError::Cancelled
                    .with_context(ExecContext::new(step, phase, Operation::ToolExecution)));
            }

            if let Some(summary) = respond_summary {
                self.state.done = true;
                hooks.on_done(&summary);
            }

            self.state.step += 1;
        }

        // Reaching the ceiling without done is the model yielding.
        Ok(())
    }

    /// Evaluate soft caps; checked before every step.
    fn soft_cap(&self) -> Option<SoftCapKind> {
        if self.state.tool_calls_total >= self.config.max_tool_calls {
            return Some(SoftCapKind::ToolCalls {
                count: self.state.tool_calls_total,
                limit: self.config.max_tool_calls,
            });
        }
        let build_failures = self.state.failures(BUILD_FAILURE_KEY);
        if build_failures >= self.config.max_build_failures {
            return Some(SoftCapKind::BuildFailures {
                count: build_failures,
                limit: self.config.max_build_failures,
            });
        }
        for (key, count) in &self.state.failure_counts {
            if let Some(file) = key.strip_prefix("search_replace:") {
                if *count >= self.config.max_search_replace_failures {
                    return Some(SoftCapKind::SearchReplaceFailures {
                        file: file.to_string(),
                        count: *count,
                        limit: self.config.max_search_replace_failures,
                    });
                }
            }
        }
        None
    }

    fn note_failure(&mut self, call: &ToolCallRequest) {
        match self.tools.category(&call.name) {
            Some(ToolCategory::Build) => {
                self.state.record_failure(BUILD_FAILURE_KEY);
            }
            Some(ToolCategory::Edit) if call.name.contains("search_replace") => {
                let file = call
                    .args
                    .get("path")
                    .or_else(|| call.args.get("file_path"))
                    .or_else(|| call.args.get("file"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("<unknown>");
                self.state.record_failure(search_replace_failure_key(file));
            }
            _ => {}
        }
    }

    fn drain_tool_events(&mut self, hooks: &HookBus) {
        while let Ok(event) = self.tool_events.try_recv() {
            match event {
                ToolEvent::PlanUpdated(plan) => {
                    hooks.on_plan_updated(&plan);
                    self.state.edit_blocked = false;
                    self.state.plan = Some(plan);
                }
            }
        }
    }

    /// One model call under the retry policy, streaming or not.
    async fn call_llm(
        &mut self,
        messages: Vec<Message>,
        tools: Vec<dodo_model::ToolSchema>,
        cancel: &CancellationToken,
        hooks: &HookBus,
    ) -> Result<Completion, AgentError> {
        let req = CompletionRequest {
            messages,
            tools,
            stream: self.config.streaming,
        };
        let client = Arc::clone(&self.client);
        let streaming = self.config.streaming;
        let mut retries = 0u32;

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AgentError::Cancelled),
            r = retry_llm(&self.llm_retry, cancel, hooks, &mut retries, || {
                let client = Arc::clone(&client);
                let req = req.clone();
                async move {
                    if streaming {
                        consume_stream(client, req, hooks).await
                    } else {
                        client.complete(req).await
                    }
                }
            }) => r,
        };
        self.state.retries += retries;
        result
    }

    /// Execute tool calls concurrently, preserving response order.
    ///
    /// Each call is validated first; a validation failure skips execution
    /// and yields an error output.  Returns the outputs positionally plus
    /// whether the run was cancelled mid-dispatch (missing results are
    /// substituted with "cancelled" errors so the caller can still append
    /// a tool message per call).
    async fn dispatch(
        &self,
        calls: &[ToolCallRequest],
        cancel: &CancellationToken,
        hooks: &HookBus,
    ) -> (Vec<ToolOutput>, bool) {
        enum Pending {
            Ready(ToolOutput),
            Task(tokio::task::JoinHandle<ToolOutput>),
        }

        let mut pending = Vec::with_capacity(calls.len());
        for call in calls {
            hooks.on_tool_call(call);
            let tc = ToolCall {
                id: call.id.clone(),
                name: call.name.clone(),
                args: call.args_value(),
            };
            if let Err(msg) = self.tools.validate(&tc) {
                pending.push(Pending::Ready(ToolOutput::err(
                    &call.id,
                    format!("validation error: {msg}"),
                )));
                continue;
            }
            let registry = Arc::clone(&self.tools);
            let policy = if self.tools.retryable(&call.name) {
                self.tool_retry.clone()
            } else {
                RetryPolicy::none()
            };
            let task_cancel = cancel.clone();
            let task_hooks = hooks.clone();
            pending.push(Pending::Task(tokio::spawn(async move {
                retry_tool(&policy, &task_cancel, &task_hooks, &registry, &tc).await
            })));
        }

        let mut outputs = Vec::with_capacity(calls.len());
        let mut cancelled = false;
        for (i, entry) in pending.into_iter().enumerate() {
            match entry {
                Pending::Ready(out) => outputs.push(out),
                Pending::Task(mut handle) => {
                    if cancelled {
                        handle.abort();
                        outputs.push(ToolOutput::err(&calls[i].id, "cancelled"));
                        continue;
                    }
                    let out = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            handle.abort();
                            cancelled = true;
                            ToolOutput::err(&calls[i].id, "cancelled")
                        }
                        joined = &mut handle => match joined {
                            Ok(out) => out,
                            Err(e) => ToolOutput::err(
                                &calls[i].id,
                                format!("tool execution panicked: {e}"),
                            ),
                        },
                    };
                    outputs.push(out);
                }
            }
        }
        (outputs, cancelled || cancel.is_cancelled())
    }
}

/// Consume a streamed model response into a [`Completion`], forwarding
/// text deltas to observers and reconstructing tool calls from fragments.
async fn consume_stream(
    client: Arc<dyn LlmClient>,
    req: CompletionRequest,
    hooks: &HookBus,
) -> Result<Completion, ClientError> {
    let mut stream = client.stream(req).await?;
    let mut content = String::new();
    let mut usage = Usage::default();
    let mut assembler = ToolCallAssembler::new();

    while let Some(event) = stream.next().await {
        match event? {
            StreamEvent::TextDelta(delta) => {
                hooks.on_stream_delta(&delta);
                content.push_str(&delta);
            }
            StreamEvent::ToolCallDelta {
                index,
                id,
                name,
                arguments,
                error,
            } => assembler.push(index, &id, &name, &arguments, error.as_deref()),
            StreamEvent::Usage(u) => usage.add(u),
            StreamEvent::Done => break,
            StreamEvent::Error(e) => {
                debug!("model stream warning: {e}");
            }
        }
    }

    Ok(Completion {
        content,
        tool_calls: assembler.finish(),
        usage,
    })
}
