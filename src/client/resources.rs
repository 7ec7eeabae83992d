//! Per-resource admin operations.

use super::{AdminClient, ClientResult};
use crate::resources::{Collection, Document, Domain, Module, Namespace, Route, Secret, Service};

/// Create/get/delete/list for kinds addressed by `(namespace, name)`.
macro_rules! namespaced_resource {
    ($ty:ty, $path:literal, $create:ident, $get:ident, $delete:ident, $list:ident) => {
        impl AdminClient {
            pub async fn $create(&self, item: &$ty) -> ClientResult<()> {
                self.put($path, item).await
            }

            pub async fn $get(&self, name: &str, namespace: &str) -> ClientResult<$ty> {
                self.get_one(&format!("{}/{}", $path, name), &[("namespace", namespace)])
                    .await
            }

            pub async fn $delete(&self, name: &str, namespace: &str) -> ClientResult<()> {
                self.delete_named($path, name, namespace).await
            }

            pub async fn $list(&self, namespace: &str) -> ClientResult<Vec<$ty>> {
                self.get_list($path, &[("namespace", namespace)]).await
            }
        }
    };
}

namespaced_resource!(Service, "/service", create_service, get_service, delete_service, list_services);
namespaced_resource!(Route, "/route", create_route, get_route, delete_route, list_routes);
namespaced_resource!(Module, "/module", create_module, get_module, delete_module, list_modules);
namespaced_resource!(Domain, "/domain", create_domain, get_domain, delete_domain, list_domains);
namespaced_resource!(Secret, "/secret", create_secret, get_secret, delete_secret, list_secrets);
namespaced_resource!(
    Collection,
    "/collection",
    create_collection,
    get_collection,
    delete_collection,
    list_collections
);

impl AdminClient {
    pub async fn create_namespace(&self, namespace: &Namespace) -> ClientResult<()> {
        self.put("/namespace", namespace).await
    }

    pub async fn get_namespace(&self, name: &str) -> ClientResult<Namespace> {
        self.get_one(&format!("/namespace/{}", name), &[]).await
    }

    pub async fn delete_namespace(&self, name: &str) -> ClientResult<()> {
        self.delete_path(&format!("/namespace/{}", name), &[]).await
    }

    pub async fn list_namespaces(&self) -> ClientResult<Vec<Namespace>> {
        self.get_list("/namespace", &[]).await
    }

    pub async fn create_document(&self, document: &Document) -> ClientResult<()> {
        self.put("/document", document).await
    }

    pub async fn get_document(&self, id: &str, namespace: &str, collection: &str) -> ClientResult<Document> {
        self.get_one(
            &format!("/document/{}", id),
            &[("namespace", namespace), ("collection", collection)],
        )
        .await
    }

    pub async fn delete_document(&self, id: &str, namespace: &str, collection: &str) -> ClientResult<()> {
        self.delete_path(
            &format!("/document/{}", id),
            &[("namespace", namespace), ("collection", collection)],
        )
        .await
    }

    /// Delete every document of a collection.
    pub async fn delete_all_documents(&self, namespace: &str, collection: &str) -> ClientResult<()> {
        self.delete_path("/document", &[("namespace", namespace), ("collection", collection)])
            .await
    }

    pub async fn list_documents(&self, namespace: &str, collection: &str) -> ClientResult<Vec<Document>> {
        self.get_list("/document", &[("namespace", namespace), ("collection", collection)])
            .await
    }
}
