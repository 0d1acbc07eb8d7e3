pub mod config;
pub mod conversation;
pub mod library;
pub mod logging;
pub mod message;
pub mod output;
pub mod prompts;
pub mod retry;
pub mod transport;

pub use config::{
    Config, ConfigError, ConfigStore, GenerationConfig, LibraryConfig, LlmConfig, OutputConfig,
    PromptConfig, RecentUsage,
};
pub use conversation::{
    build_turn, CheckpointError, ConversationDriver, ConversationError, ConversationObserver,
    ConversationOutcome, ConversationState, GenerationSettings, NoopObserver, StagePlan,
    StagePosition, StageSpec, Turn, TurnError, CHECKPOINT_FILE_NAME,
};
pub use library::{
    FragmentLibrary, FragmentSelection, IntroRecord, LibraryError, PlotRecord, Seeding,
    StoryInputs,
};
pub use logging::{
    LogLevel, LogRecord, LogSink, NullLogSink, SharedLogSink, StdoutLogSink, VecLogSink,
};
pub use message::{Message, Role};
pub use output::{DirectorySink, OutputError, StoryDocument, StorySink};
pub use prompts::{PromptError, PromptRegistry};
pub use retry::{
    call_transport_with_retry, call_with_retry, FixedJitter, JitterSource, RandomJitter,
    RetryConfig, RetryContext, RetryError, Sleeper, ThreadSleeper,
};
pub use transport::{
    aggregate_fragments, ChatRequest, ChatTransport, TransportError, TransportErrorKind,
};
