/*
 * Scheduling Policies Module
 *
 * This module contains the scheduling policy implementations. Each policy
 * implements the SchedPolicy trait and is instantiated once per CPU.
 *
 * Available policies:
 * - PriorityRoundRobin: strict priority, round-robin within a level (default)
 */

pub mod priority_rr;

pub use priority_rr::PriorityRoundRobin;
