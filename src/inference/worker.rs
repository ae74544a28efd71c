//! Generation worker thread
//!
//! llama.cpp handles (`LlamaBackend`, `LlamaModel`, `LlamaContext`) hold raw
//! pointers and are not `Send`, so they all live on one dedicated thread. The
//! caller talks to it over a command channel and reads each completion as a
//! stream of [`StreamToken`]s.
//!
//! Every request builds its own context from the request's parameters and
//! drops it when the stream ends, whether it finished or failed.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::LlamaModel;

use crate::inference::batch::MAX_STEP_WIDTH;
use crate::inference::controller::{GenerationController, GenerationError};
use crate::inference::engine::{EngineConfig, EngineError, InferenceEngine, LlamaCppEngine};
use crate::inference::stop::StopPolicy;
use crate::inference::streaming::{StopSignal, StreamToken};

/// Per-request generation parameters
#[derive(Debug, Clone)]
pub struct GenerationParams {
    /// Maximum number of tokens to generate
    pub max_tokens: u32,
    /// Context window size
    pub context_size: u32,
    /// Widest prompt chunk per decode call
    pub batch_size: u32,
    /// Threads for generation and prompt processing
    pub threads: u32,
    /// Prepend BOS when tokenizing the prompt
    pub add_bos: bool,
    /// Model-specific early stop rules
    pub stop_policy: StopPolicy,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: 256,
            context_size: 2048,
            batch_size: MAX_STEP_WIDTH as u32,
            threads: 4,
            add_bos: true,
            stop_policy: StopPolicy::default(),
        }
    }
}

impl GenerationParams {
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            context_size: self.context_size,
            batch_size: self.batch_size,
            threads: i32::try_from(self.threads).unwrap_or(i32::MAX),
            add_bos: self.add_bos,
        }
    }
}

/// What the worker reports after a model load
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedModelInfo {
    pub path: PathBuf,
    pub vocab_size: usize,
    /// Context length the model was trained with
    pub train_context: u32,
}

enum WorkerCommand {
    LoadModel {
        path: PathBuf,
        gpu_layers: u32,
        reply: Sender<Result<LoadedModelInfo, EngineError>>,
    },
    UnloadModel,
    Generate {
        prompt: String,
        params: GenerationParams,
        tokens: Sender<StreamToken>,
        cancel: Arc<AtomicBool>,
    },
    Shutdown,
}

/// Handle to the generation worker thread
#[derive(Default)]
pub struct GenerationWorker {
    command_tx: Option<Sender<WorkerCommand>>,
    worker_handle: Option<JoinHandle<()>>,
    model_info: Option<LoadedModelInfo>,
}

impl GenerationWorker {
    /// Creates a worker with no thread running yet
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns the worker thread and waits until it has initialized the
    /// llama.cpp backend.
    pub fn init(&mut self) -> Result<(), EngineError> {
        if self.command_tx.is_some() {
            return Ok(());
        }

        let (command_tx, command_rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::channel();

        let handle = thread::Builder::new()
            .name("llmstream-worker".to_string())
            .spawn(move || worker_main(command_rx, ready_tx))
            .map_err(|e| EngineError::WorkerError(e.to_string()))?;

        let ready = ready_rx
            .recv()
            .map_err(|e| EngineError::WorkerError(e.to_string()))
            .and_then(|started| started);
        if let Err(e) = ready {
            let _ = handle.join();
            return Err(e);
        }

        self.command_tx = Some(command_tx);
        self.worker_handle = Some(handle);
        tracing::info!("Generation worker started");
        Ok(())
    }

    /// Loads a GGUF model, replacing any model already loaded.
    pub fn load_model<P: AsRef<Path>>(
        &mut self,
        path: P,
        gpu_layers: u32,
    ) -> Result<LoadedModelInfo, EngineError> {
        let (reply, response) = mpsc::channel();
        self.send(WorkerCommand::LoadModel {
            path: path.as_ref().to_path_buf(),
            gpu_layers,
            reply,
        })?;

        let info = response
            .recv()
            .map_err(|e| EngineError::WorkerError(e.to_string()))??;
        self.model_info = Some(info.clone());
        Ok(info)
    }

    pub fn unload_model(&mut self) {
        if self.model_info.take().is_some() {
            let _ = self.send(WorkerCommand::UnloadModel);
        }
    }

    pub fn model_info(&self) -> Option<&LoadedModelInfo> {
        self.model_info.as_ref()
    }

    pub fn is_model_loaded(&self) -> bool {
        self.model_info.is_some()
    }

    pub fn is_initialized(&self) -> bool {
        self.command_tx.is_some()
    }

    /// Starts a generation and returns the token stream plus a flag that
    /// cancels it between steps.
    pub fn generate_stream(
        &self,
        prompt: &str,
        params: GenerationParams,
    ) -> Result<(Receiver<StreamToken>, Arc<AtomicBool>), EngineError> {
        if self.command_tx.is_some() && self.model_info.is_none() {
            return Err(EngineError::NoModelLoaded);
        }

        let (tokens, stream) = mpsc::channel();
        let cancel = Arc::new(AtomicBool::new(false));
        self.send(WorkerCommand::Generate {
            prompt: prompt.to_string(),
            params,
            tokens,
            cancel: Arc::clone(&cancel),
        })?;

        Ok((stream, cancel))
    }

    fn send(&self, command: WorkerCommand) -> Result<(), EngineError> {
        self.command_tx
            .as_ref()
            .ok_or(EngineError::BackendNotInitialized)?
            .send(command)
            .map_err(|e| EngineError::WorkerError(e.to_string()))
    }
}

impl Drop for GenerationWorker {
    fn drop(&mut self) {
        if let Some(tx) = self.command_tx.take() {
            let _ = tx.send(WorkerCommand::Shutdown);
        }
        if let Some(handle) = self.worker_handle.take() {
            let _ = handle.join();
        }
    }
}

/// Owns the backend and the loaded model until shutdown or until the
/// command channel closes.
fn worker_main(commands: Receiver<WorkerCommand>, ready: Sender<Result<(), EngineError>>) {
    let backend = match LlamaBackend::init() {
        Ok(backend) => backend,
        Err(e) => {
            tracing::error!("Failed to init backend: {e}");
            let _ = ready.send(Err(EngineError::BackendInit(e.to_string())));
            return;
        }
    };
    let _ = ready.send(Ok(()));

    let mut model: Option<LlamaModel> = None;
    for command in commands {
        match command {
            WorkerCommand::LoadModel {
                path,
                gpu_layers,
                reply,
            } => {
                model = None;
                let loaded = load_gguf(&backend, &path, gpu_layers).map(|(loaded, info)| {
                    model = Some(loaded);
                    info
                });
                let _ = reply.send(loaded);
            }
            WorkerCommand::UnloadModel => {
                model = None;
                tracing::debug!("Model unloaded");
            }
            WorkerCommand::Generate {
                prompt,
                params,
                tokens,
                cancel,
            } => {
                let Some(model) = model.as_ref() else {
                    let _ = tokens.send(StreamToken::Error(EngineError::NoModelLoaded.to_string()));
                    continue;
                };
                if let Err(e) = generate(&backend, model, &prompt, &params, &tokens, &cancel) {
                    tracing::error!("Generation failed: {e}");
                    let _ = tokens.send(StreamToken::Error(e.to_string()));
                }
            }
            WorkerCommand::Shutdown => break,
        }
    }
    tracing::debug!("Generation worker exiting");
}

fn load_gguf(
    backend: &LlamaBackend,
    path: &Path,
    gpu_layers: u32,
) -> Result<(LlamaModel, LoadedModelInfo), EngineError> {
    let params = LlamaModelParams::default().with_n_gpu_layers(gpu_layers);
    let model = LlamaModel::load_from_file(backend, path, &params)
        .map_err(|e| EngineError::ModelLoad(e.to_string()))?;

    let info = LoadedModelInfo {
        path: path.to_path_buf(),
        vocab_size: usize::try_from(model.n_vocab()).unwrap_or_default(),
        train_context: model.n_ctx_train(),
    };
    tracing::debug!(
        "Loaded {} with {gpu_layers} GPU layers ({} MiB)",
        path.display(),
        model.size() / (1024 * 1024)
    );
    Ok((model, info))
}

fn generate(
    backend: &LlamaBackend,
    model: &LlamaModel,
    prompt: &str,
    params: &GenerationParams,
    tokens: &Sender<StreamToken>,
    cancel: &AtomicBool,
) -> Result<StopSignal, GenerationError> {
    let engine = LlamaCppEngine::new(backend, model, &params.engine_config())?;
    let mut controller = GenerationController::new(engine, params.stop_policy.clone())?;
    stream(&mut controller, prompt, params.max_tokens as usize, tokens, cancel)
}

/// Streams one completion of `prompt` into `tokens`, then empties the
/// engine cache.
///
/// A finished stream ends with `StreamToken::Done`, carrying
/// `StopSignal::None` when `cancel` was set or the receiver went away. On
/// error nothing more is sent and the error is returned.
pub fn stream<E: InferenceEngine>(
    controller: &mut GenerationController<E>,
    prompt: &str,
    max_tokens: usize,
    tokens: &Sender<StreamToken>,
    cancel: &AtomicBool,
) -> Result<StopSignal, GenerationError> {
    let finished = pump(controller, prompt, max_tokens, tokens, cancel);
    controller.clear_cache();

    let signal = finished?;
    let _ = tokens.send(StreamToken::Done(signal));
    Ok(signal)
}

fn pump<E: InferenceEngine>(
    controller: &mut GenerationController<E>,
    prompt: &str,
    max_tokens: usize,
    tokens: &Sender<StreamToken>,
    cancel: &AtomicBool,
) -> Result<StopSignal, GenerationError> {
    let mut cursor = controller.init(prompt, max_tokens)?;

    loop {
        if cancel.load(Ordering::Relaxed) {
            tracing::debug!("Generation cancelled");
            return Ok(StopSignal::None);
        }

        let out = controller.step(cursor)?;
        cursor = out.cursor;

        if !out.chunk.is_empty() && tokens.send(StreamToken::Token(out.chunk)).is_err() {
            tracing::debug!("Receiver dropped, stopping generation");
            return Ok(StopSignal::None);
        }
        if out.signal.is_stop() {
            return Ok(out.signal);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::batch::TokenId;
    use crate::inference::controller::Phase;
    use crate::inference::testing::{ScriptedEngine, EOG};

    const HELLO: TokenId = 20;
    const WORLD: TokenId = 21;

    fn scripted(script: Vec<TokenId>) -> GenerationController<ScriptedEngine> {
        let engine = ScriptedEngine::new(vec![1, 10, 11], script)
            .piece(HELLO, b"Hello")
            .piece(WORLD, b" world");
        GenerationController::new(engine, StopPolicy::default()).unwrap()
    }

    #[test]
    fn test_worker_new() {
        let worker = GenerationWorker::new();
        assert!(!worker.is_initialized());
        assert!(!worker.is_model_loaded());
        assert!(worker.model_info().is_none());
    }

    #[test]
    fn test_generation_params_default() {
        let params = GenerationParams::default();
        assert_eq!(params.max_tokens, 256);
        assert_eq!(params.context_size, 2048);
        assert_eq!(params.batch_size, 512);
        assert!(params.stop_policy.role_markers.is_empty());

        let config = params.engine_config();
        assert_eq!(config.context_size, 2048);
        assert_eq!(config.threads, 4);
    }

    #[test]
    fn test_unload_without_model() {
        let mut worker = GenerationWorker::new();
        worker.unload_model();
        assert!(!worker.is_model_loaded());
    }

    #[test]
    fn test_calls_before_init_fail() {
        let mut worker = GenerationWorker::new();
        assert!(matches!(
            worker.load_model("missing.gguf", 0),
            Err(EngineError::BackendNotInitialized)
        ));
        assert!(matches!(
            worker.generate_stream("hi", GenerationParams::default()),
            Err(EngineError::BackendNotInitialized)
        ));
    }

    #[test]
    fn test_stream_ends_with_done() {
        let mut controller = scripted(vec![HELLO, WORLD, EOG]);
        let (tx, rx) = mpsc::channel();

        let signal = stream(&mut controller, "Hi", 16, &tx, &AtomicBool::new(false)).unwrap();
        assert_eq!(signal, StopSignal::EndOfGeneration);

        drop(tx);
        let received: Vec<StreamToken> = rx.iter().collect();
        assert_eq!(
            received,
            vec![
                StreamToken::Token("Hello".to_string()),
                StreamToken::Token(" world".to_string()),
                StreamToken::Done(StopSignal::EndOfGeneration),
            ]
        );
        assert_eq!(controller.engine().cache_clears, 1);
        assert_eq!(controller.phase(), Phase::Idle);
    }

    #[test]
    fn test_stream_reports_max_length() {
        let mut controller = scripted(vec![HELLO, WORLD, HELLO, WORLD]);
        let (tx, rx) = mpsc::channel();

        stream(&mut controller, "Hi", 2, &tx, &AtomicBool::new(false)).unwrap();

        drop(tx);
        let received: Vec<StreamToken> = rx.iter().collect();
        assert_eq!(received.len(), 3);
        assert_eq!(
            received.last().and_then(StreamToken::stop_signal),
            Some(StopSignal::MaxLengthReached)
        );
    }

    #[test]
    fn test_cancelled_stream_ends_with_none() {
        let mut controller = scripted(vec![HELLO, WORLD, EOG]);
        let (tx, rx) = mpsc::channel();

        let signal = stream(&mut controller, "Hi", 16, &tx, &AtomicBool::new(true)).unwrap();
        assert_eq!(signal, StopSignal::None);

        drop(tx);
        let received: Vec<StreamToken> = rx.iter().collect();
        assert_eq!(received, vec![StreamToken::Done(StopSignal::None)]);
        // Only the prompt was decoded
        assert_eq!(controller.engine().evaluations.len(), 1);
        assert_eq!(controller.engine().cache_clears, 1);
    }

    #[test]
    fn test_dropped_receiver_stops_stream() {
        let mut controller = scripted(vec![HELLO, WORLD, HELLO, WORLD, EOG]);
        let (tx, rx) = mpsc::channel();
        drop(rx);

        let signal = stream(&mut controller, "Hi", 16, &tx, &AtomicBool::new(false)).unwrap();
        assert_eq!(signal, StopSignal::None);
        assert_eq!(controller.engine().evaluations.len(), 2);
        assert_eq!(controller.engine().cache_clears, 1);
    }

    #[test]
    fn test_stream_error_is_returned_and_cache_cleared() {
        let mut controller = scripted(vec![HELLO]);
        let (tx, rx) = mpsc::channel();

        let result = stream(&mut controller, "", 16, &tx, &AtomicBool::new(false));
        assert!(matches!(result, Err(GenerationError::EmptyPrompt)));
        assert!(rx.try_recv().is_err());
        assert_eq!(controller.engine().cache_clears, 1);
    }
}
