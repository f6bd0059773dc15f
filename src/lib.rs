//! 单线程事件循环 Demo
//!
//! 所谓的事件循环（以下简称Event Loop），其实和操作系统的调度器十分类似，
//! 只是它把"待执行的回调"分成了几类队列，并按固定的阶段顺序消费它们：
//! - 宏任务（`Task`）：`spawn`进来的普通任务，调度器一次只取一个执行
//! - 微任务（`Microtask`）：`spawn_micro`进来的任务。每执行完一个宏任务，
//!   微任务队列会被完整清空（包括清空过程中新产生的微任务），然后才轮到下一个宏任务
//! - 定时器（`Timer`）：到期的`Sleep`在专门的定时器阶段被唤醒，最早到期的最先触发
//! - I/O：所有队列都空了，就阻塞在I/O多路复用上（Demo中为`reactor`），
//!   超时时间取最近一个定时器的到期时间
//!
//! 每一轮循环的阶段顺序：轮询主`Future` -> 清空微任务 -> 触发到期定时器 ->
//! 逐个执行宏任务（每个之后清空一次微任务） -> 再轮询主`Future` -> 阻塞等待I/O。
//!
//! 在这个Event Loop之上还有一个三路由的演示HTTP服务（见`http`模块）：
//! - `GET /`：立刻响应，演示非阻塞处理
//! - `GET /block`：在循环线程上跑一个同步计数大循环再响应，演示阻塞会拖住所有连接
//! - `GET /offload`：每个请求起一个`Worker`线程，消息传递收发结果，
//!   演示把CPU密集工作搬出循环线程
//!
//! `Worker`（见`worker`模块）拥有独立的调用栈和状态，只通过消息与循环线程通信；
//! 它完成工作后向一个注册在`reactor`上的管道写一个字节来唤醒Event Loop。

pub mod executor;
pub mod http;
pub mod tcp;
pub mod timer;
pub mod worker;

mod reactor;
