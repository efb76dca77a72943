//! 多作用域权益核心
//! 组织与群组成员关系、订阅账本、批量授权、用量计量与请求授权

pub mod auth;
pub mod concurrency;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod providers;
pub mod repository;
pub mod routes;
pub mod services;
pub mod telemetry;
