//! HTTP 处理器模块

pub mod admin;
pub mod batch;
pub mod group;
pub mod health;
pub mod organization;
pub mod plan;
pub mod subscription;
pub mod usage;
pub mod webhook;
