//! 宏任务/微任务排序演示
//!
//! 主Future（"脚本"）先跑完，然后微任务队列被完整清空（包括微任务里再排进来的
//! 微任务），最后才轮到宏任务。对照输出行首的序号可以看到完整顺序。

use mini_event_loop::executor::{yield_now, Executor};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let ex = Executor::new();
    ex.block_on(|| async {
        println!("[1] script start");

        Executor::spawn(async {
            println!("[5] task: runs after every microtask");
        });

        Executor::spawn_micro(async {
            println!("[3] microtask 1");
            Executor::spawn_micro(async {
                println!("[4] microtask 2, scheduled by microtask 1, same drain");
            });
        });

        println!("[2] script end");

        yield_now().await;
        println!("[6] script resumed after the task queue drained");
    });

    println!();
    println!("script start/end first, microtasks fully drained, then tasks.");
}
