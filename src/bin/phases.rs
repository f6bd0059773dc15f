//! 阶段化调度演示
//!
//! 一轮循环按 定时器阶段 -> 宏任务阶段 -> I/O等待 推进。
//! 先到期的定时器先触发，不到期之前循环阻塞在I/O等待上，不空转。

use mini_event_loop::executor::Executor;
use mini_event_loop::timer::sleep;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let start = Instant::now();
    let ms = move || start.elapsed().as_secs_f64() * 1e3;

    let ex = Executor::new();
    ex.block_on(|| async move {
        println!("[{:>7.3}ms] begin", ms());

        Executor::spawn(async move {
            println!("[{:>7.3}ms] immediate task, no timer", ms());
        });

        Executor::spawn(async move {
            sleep(Duration::from_millis(20)).await;
            println!("[{:>7.3}ms] 20ms timer fired", ms());
        });

        Executor::spawn(async move {
            sleep(Duration::from_millis(10)).await;
            println!("[{:>7.3}ms] 10ms timer fired", ms());
        });

        sleep(Duration::from_millis(40)).await;
        println!("[{:>7.3}ms] 40ms main timer fired, loop is idle until then", ms());
    });

    println!();
    println!("Total elapsed: {:?}", start.elapsed());
    println!("immediate task first, then 10ms before 20ms, deadline order.");
}
