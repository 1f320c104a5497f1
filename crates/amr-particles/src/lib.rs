//! Particle species on an adaptive mesh hierarchy: containers, proxy
//! particles across level boundaries, redistribution, and the level advance
//! that moves particles through a gravitational field.

pub mod amr;
pub mod comm;
pub mod config;
pub mod container;
pub mod context;
pub mod cosmology;
pub mod error;
pub mod field;
pub mod gate;
pub mod gravity;
pub mod io;
pub mod orchestrator;
pub mod particle;
pub mod proxy;
pub mod registry;
pub mod species;

pub use amr::{AmrHierarchy, AmrLevel, BoxArray, DistributionMap, Geometry, IndexBox};
pub use comm::{Communicator, SerialCommunicator};
pub use config::{InitMode, InitSpec, MovePolicy, ParticleConfig, RunConfig};
pub use container::{RedistributeStats, SpeciesContainer};
pub use context::{EnergyAdded, SimulationContext};
pub use cosmology::{EinsteinDeSitter, ScaleFactor, Static, StepFactors};
pub use error::{ParticleError, Result};
pub use field::MultiField;
pub use gate::{DecompositionSnapshot, GateOutcome, RedistributionGate};
pub use gravity::{GravitySolver, SolveInputs, TimeLevel, TreeGravity, TreeGravityConfig, UniformGravity};
pub use orchestrator::HydroSolver;
pub use particle::Particle;
pub use proxy::ProxyFactory;
pub use registry::{ContainerRegistry, SpeciesEntry};
pub use species::{Role, SpeciesKind};
