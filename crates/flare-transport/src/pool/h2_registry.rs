//! 按路由登记的 h2 连接。
//!
//! h2 连接不“归还”到空闲列表，而是常驻注册表，由各交换按槽位共享。
//! 同一路由新建连接由异步锁串行化：拿到锁后先复查一次，确保并发调用方共享同一条新连接。
//! 锁顺序与 HTTP/1.1 空闲池一致：路由列表锁 → 映射分片。

use crate::connection::{H2Connection, H2Lease};
use crate::route::Route;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, trace};

#[derive(Default)]
struct RouteConnections {
    connections: Vec<H2Connection>,
    retired: bool,
}

#[derive(Default)]
pub struct H2Registry {
    routes: DashMap<Route, Arc<Mutex<RouteConnections>>>,
    creation: DashMap<Route, Arc<tokio::sync::Mutex<()>>>,
}

impl H2Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn list(&self, route: &Route) -> Option<Arc<Mutex<RouteConnections>>> {
        self.routes.get(route).map(|entry| Arc::clone(entry.value()))
    }

    /// 先在软目标内挑选连接，找不到再只受对端上限约束地挑选。
    pub fn try_acquire(&self, route: &Route, streams_per_connection: usize) -> Option<H2Lease> {
        let list = self.list(route)?;
        let list = list.lock();
        list.connections
            .iter()
            .find_map(|connection| connection.try_lease(Some(streams_per_connection)))
            .or_else(|| {
                list.connections
                    .iter()
                    .find_map(|connection| connection.try_lease(None))
            })
    }

    /// 只在软目标内挑选；用于持有创建锁后的复查。
    pub fn try_acquire_under_limit(
        &self,
        route: &Route,
        streams_per_connection: usize,
    ) -> Option<H2Lease> {
        let list = self.list(route)?;
        let list = list.lock();
        list.connections
            .iter()
            .find_map(|connection| connection.try_lease(Some(streams_per_connection)))
    }

    /// 同一路由的建连锁。
    pub fn creation_lock(&self, route: &Route) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.creation.entry(route.clone()).or_default().value())
    }

    pub fn register(&self, connection: H2Connection) {
        loop {
            let list = Arc::clone(
                self.routes
                    .entry(connection.route().clone())
                    .or_default()
                    .value(),
            );
            let mut list = list.lock();
            if list.retired {
                continue;
            }
            trace!(route = %connection.route(), connection_id = %connection.id(), "h2 connection registered");
            list.connections.push(connection);
            return;
        }
    }

    /// 从注册表中移除；返回是否确实移除了该连接。
    pub fn unregister(&self, connection: &H2Connection) -> bool {
        let Some(list) = self.list(connection.route()) else {
            return false;
        };
        let mut list = list.lock();
        let before = list.connections.len();
        list.connections
            .retain(|registered| !registered.same_as(connection));
        before != list.connections.len()
    }

    /// 摘除某条路由上已失效的连接，交给调用方关闭。
    pub fn cleanup_dead(&self, route: &Route) -> Vec<H2Connection> {
        let Some(list) = self.list(route) else {
            return Vec::new();
        };
        let mut list = list.lock();
        let (alive, dead): (Vec<_>, Vec<_>) = std::mem::take(&mut list.connections)
            .into_iter()
            .partition(H2Connection::is_alive);
        list.connections = alive;
        dead
    }

    /// 摘除所有路由上已失效的连接，并删除清空的路由项。
    pub fn cleanup_all_dead(&self) -> Vec<H2Connection> {
        let snapshot: Vec<(Route, Arc<Mutex<RouteConnections>>)> = self
            .routes
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();
        let mut dead = Vec::new();
        for (route, list) in snapshot {
            let mut guard = list.lock();
            let (alive, removed): (Vec<_>, Vec<_>) = std::mem::take(&mut guard.connections)
                .into_iter()
                .partition(H2Connection::is_alive);
            guard.connections = alive;
            dead.extend(removed);
            if guard.connections.is_empty() {
                guard.retired = true;
                self.routes
                    .remove_if(&route, |_, current| Arc::ptr_eq(current, &list));
                self.creation
                    .remove_if(&route, |_, lock| Arc::strong_count(lock) == 1);
            }
        }
        if !dead.is_empty() {
            debug!(count = dead.len(), "removed dead h2 connections");
        }
        dead
    }

    /// 清空注册表，返回全部连接交给调用方关闭。
    pub fn close_all(&self) -> Vec<H2Connection> {
        let snapshot: Vec<(Route, Arc<Mutex<RouteConnections>>)> = self
            .routes
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();
        let mut all = Vec::new();
        for (route, list) in snapshot {
            let mut guard = list.lock();
            guard.retired = true;
            all.append(&mut guard.connections);
            self.routes
                .remove_if(&route, |_, current| Arc::ptr_eq(current, &list));
        }
        self.creation.clear();
        all
    }

    pub fn connection_count(&self) -> usize {
        self.snapshot_counts().0
    }

    /// `(连接数, 无活跃流的连接数, 活跃流总数)`。
    pub fn snapshot_counts(&self) -> (usize, usize, usize) {
        let lists: Vec<_> = self
            .routes
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        lists.iter().fold((0, 0, 0), |(total, idle, streams), list| {
            let list = list.lock();
            let active: Vec<usize> = list
                .connections
                .iter()
                .map(H2Connection::active_streams)
                .collect();
            (
                total + active.len(),
                idle + active.iter().filter(|count| **count == 0).count(),
                streams + active.iter().sum::<usize>(),
            )
        })
    }

    pub fn connections_for(&self, route: &Route) -> usize {
        self.list(route)
            .map_or(0, |list| list.lock().connections.len())
    }
}
