//! 多集群授权控制面
//! Policy / Role / MultiClusterRoleBinding 资源、调谐控制器与 Provider 抽象

pub mod app;
pub mod cache;
pub mod concurrency;
pub mod config;
pub mod controllers;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod provider;
pub mod registry;
pub mod repository;
pub mod routes;
pub mod telemetry;
