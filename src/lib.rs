pub mod accumulator;
pub mod db;
pub mod domain;
pub mod downloader;
pub mod error;
pub mod limiter;
pub mod mapper;
pub mod output;
pub mod repository;
pub mod storage;
pub mod xlsx;
