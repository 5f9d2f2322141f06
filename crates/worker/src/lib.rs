//! AxonFleet Worker
//!
//! Everything one serving identity runs inside its own process: the weight
//! synchronization loop, its collaborators (metagraph, axon, model) and the
//! fault reporting that lets the supervisor see why a worker died.

pub mod axon;
pub mod batching;
pub mod checkpoint;
pub mod fault;
pub mod metagraph;
pub mod model;
pub mod neuron;
pub mod params;
pub mod schedule;
pub mod synchronizer;
pub mod weights;

pub use axon::{Axon, PriorityAxon};
pub use metagraph::{FileMetagraph, InMemoryMetagraph, Metagraph, PeerId, SharedState};
pub use model::{Batch, Device, ForwardOutput, Model, PeerScoringModel};
pub use neuron::{serve, Neuron, NeuronSummary};
pub use params::SharedParameters;
pub use synchronizer::{SyncSettings, SyncState, WeightSynchronizer};
pub use weights::{WeightMatrix, WeightVector};
